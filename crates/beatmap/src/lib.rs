use thiserror::Error;

mod document;
pub use document::*;
mod pending;
pub use pending::*;
mod value;
pub use value::*;

#[derive(Debug, Error)]
pub enum BeatmapError {
    #[error("snapshot encode failed: {0}")]
    SnapshotEncode(String),
    #[error("snapshot decode failed: {0}")]
    SnapshotDecode(String),
}

pub type Result<T> = std::result::Result<T, BeatmapError>;

/// Time in milliseconds from the start of the audio track.
pub type Millis = i64;
