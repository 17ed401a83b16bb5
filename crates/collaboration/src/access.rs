/// Access levels and the gate rooms consult before accepting edits
use beatmap::DocumentId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{CollaborationError, UserId};

/// Ordered access level: `None < View < Comment < Edit < Owner`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    View,
    Comment,
    Edit,
    Owner,
}

impl AccessLevel {
    pub fn can_edit(self) -> bool {
        self >= AccessLevel::Edit
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessLevel::None => "none",
            AccessLevel::View => "view",
            AccessLevel::Comment => "comment",
            AccessLevel::Edit => "edit",
            AccessLevel::Owner => "owner",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessLevel {
    type Err = CollaborationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AccessLevel::None),
            "view" => Ok(AccessLevel::View),
            "comment" => Ok(AccessLevel::Comment),
            "edit" => Ok(AccessLevel::Edit),
            "owner" => Ok(AccessLevel::Owner),
            other => Err(CollaborationError::Config(format!(
                "unknown access level: {}",
                other
            ))),
        }
    }
}

/// Access-control policy lookup.
///
/// Called on join and once per inbound command batch, outside the room's
/// serialization point. Implementations should answer from memory.
pub trait AccessGate: Send + Sync {
    fn access_level(&self, document: &DocumentId, user: &UserId) -> AccessLevel;
}

/// Table-driven gate: explicit grants per (document, user), then per user,
/// then a default level.
#[derive(Debug)]
pub struct StaticAccessGate {
    default_level: AccessLevel,
    users: RwLock<HashMap<UserId, AccessLevel>>,
    documents: RwLock<HashMap<(DocumentId, UserId), AccessLevel>>,
}

impl StaticAccessGate {
    pub fn new(default_level: AccessLevel) -> Self {
        Self {
            default_level,
            users: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_user(self, user: UserId, level: AccessLevel) -> Self {
        self.set_user(user, level);
        self
    }

    pub fn set_user(&self, user: UserId, level: AccessLevel) {
        self.users.write().insert(user, level);
    }

    pub fn set_document_user(&self, document: DocumentId, user: UserId, level: AccessLevel) {
        self.documents.write().insert((document, user), level);
    }
}

impl AccessGate for StaticAccessGate {
    fn access_level(&self, document: &DocumentId, user: &UserId) -> AccessLevel {
        if let Some(level) = self.documents.read().get(&(*document, *user)) {
            return *level;
        }
        self.users
            .read()
            .get(user)
            .copied()
            .unwrap_or(self.default_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(AccessLevel::None < AccessLevel::View);
        assert!(AccessLevel::View < AccessLevel::Comment);
        assert!(AccessLevel::Comment < AccessLevel::Edit);
        assert!(AccessLevel::Edit < AccessLevel::Owner);
        assert!(AccessLevel::Owner.can_edit());
        assert!(!AccessLevel::Comment.can_edit());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("Edit".parse::<AccessLevel>().unwrap(), AccessLevel::Edit);
        assert!("admin".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn test_static_gate_precedence() {
        let doc = DocumentId::new();
        let other_doc = DocumentId::new();
        let user = UserId::new();
        let gate = StaticAccessGate::new(AccessLevel::View).with_user(user, AccessLevel::Edit);
        gate.set_document_user(doc, user, AccessLevel::Owner);

        assert_eq!(gate.access_level(&doc, &user), AccessLevel::Owner);
        assert_eq!(gate.access_level(&other_doc, &user), AccessLevel::Edit);
        assert_eq!(gate.access_level(&doc, &UserId::new()), AccessLevel::View);
    }
}
