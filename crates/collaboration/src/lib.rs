/// Command-based synchronization for shared beatmap editing.
/// Clients apply edits optimistically; one authoritative room per document
/// orders, applies and rebroadcasts them.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod access;
pub use access::*;

mod command;
pub use command::*;

mod context;
pub use context::*;

mod codec;
pub use codec::*;

mod config;
pub use config::*;

mod history;
pub use history::*;

mod session;
pub use session::*;

mod presence;
pub use presence::*;

mod protocol;
pub use protocol::*;

mod persistence;
pub use persistence::*;

mod room;
pub use room::*;

mod manager;
pub use manager::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown command tag: {0}")]
    UnknownCommandTag(u8),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] beatmap::BeatmapError),

    #[error("room closed: {0}")]
    RoomClosed(beatmap::DocumentId),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identifier, supplied by the external session establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-room session identifier, assigned by the room in join order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
