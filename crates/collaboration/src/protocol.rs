/// Messages exchanged between clients and the room server.
///
/// Command batches travel as opaque payloads produced by `encode_batch`; the
/// envelope adds routing (origin session, per-recipient sequence) and room
/// membership.
use beatmap::DocumentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{from_bytes, to_bytes};
use crate::{AccessLevel, LeaveReason, Presence, Result, SessionId, UserId};

/// A connected session as seen by the other members of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub access: AccessLevel,
    pub joined_at: DateTime<Utc>,
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection
    #[serde(rename = "join")]
    Join {
        document_id: DocumentId,
        user_id: UserId,
    },

    #[serde(rename = "commands")]
    Commands { payload: Vec<u8> },

    /// Replaces the sender's presence; relayed to the other members
    #[serde(rename = "set_presence")]
    SetPresence { presence: Presence },

    /// Owner only: remove every session of `user_id` from the room
    #[serde(rename = "kick_user")]
    KickUser { user_id: UserId, reason: String },

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join reply: the assigned session id, the canonical document and the
    /// sessions already present
    #[serde(rename = "room_state")]
    RoomState {
        session_id: SessionId,
        snapshot: Vec<u8>,
        users: Vec<SessionInfo>,
    },

    /// A batch applied by the room. `origin` equal to the recipient's own
    /// session id marks an echo.
    #[serde(rename = "commands")]
    Commands {
        origin: SessionId,
        sequence: u64,
        payload: Vec<u8>,
    },

    #[serde(rename = "user_joined")]
    UserJoined { user: SessionInfo },

    #[serde(rename = "user_left")]
    UserLeft {
        session_id: SessionId,
        user_id: UserId,
        reason: LeaveReason,
    },

    #[serde(rename = "user_activity")]
    UserActivity {
        session_id: SessionId,
        presence: Presence,
    },

    /// Sent to a session right before the room drops it on an owner's request
    #[serde(rename = "kicked")]
    Kicked { reason: String },

    /// The recipient's access level changed; `None` means it was removed
    #[serde(rename = "access_changed")]
    AccessChanged { access: AccessLevel },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong,
}

impl ClientMessage {
    pub fn to_bytes(&self, limit: u64) -> Result<Vec<u8>> {
        to_bytes(self, limit)
    }

    pub fn from_bytes(bytes: &[u8], limit: u64) -> Result<Self> {
        from_bytes(bytes, limit)
    }
}

impl ServerMessage {
    pub fn to_bytes(&self, limit: u64) -> Result<Vec<u8>> {
        to_bytes(self, limit)
    }

    pub fn from_bytes(bytes: &[u8], limit: u64) -> Result<Self> {
        from_bytes(bytes, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 64 * 1024;

    #[test]
    fn test_client_message_bytes() {
        let join = ClientMessage::Join {
            document_id: DocumentId::new(),
            user_id: UserId::new(),
        };
        let bytes = join.to_bytes(LIMIT).unwrap();
        assert_eq!(ClientMessage::from_bytes(&bytes, LIMIT).unwrap(), join);
    }

    #[test]
    fn test_room_state_carries_users() {
        let message = ServerMessage::RoomState {
            session_id: SessionId(3),
            snapshot: b"{}".to_vec(),
            users: vec![SessionInfo {
                session_id: SessionId(1),
                user_id: UserId::new(),
                access: AccessLevel::Edit,
                joined_at: Utc::now(),
                presence: Presence::new().with_activity("testing"),
            }],
        };
        let bytes = message.to_bytes(LIMIT).unwrap();
        assert_eq!(ServerMessage::from_bytes(&bytes, LIMIT).unwrap(), message);
    }

    #[test]
    fn test_kick_request_bytes() {
        let kick = ClientMessage::KickUser {
            user_id: UserId::new(),
            reason: "spam".to_string(),
        };
        let bytes = kick.to_bytes(LIMIT).unwrap();
        assert_eq!(ClientMessage::from_bytes(&bytes, LIMIT).unwrap(), kick);
    }

    #[test]
    fn test_truncated_message_is_error() {
        let bytes = ServerMessage::Error {
            message: "denied".into(),
        }
        .to_bytes(LIMIT)
        .unwrap();
        assert!(ServerMessage::from_bytes(&bytes[..bytes.len() - 1], LIMIT).is_err());
    }
}
