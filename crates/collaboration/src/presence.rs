/// What a session is doing in the editor, relayed to the rest of its room
use beatmap::{EntityId, Millis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Presence {
    /// Short label shown next to the user ("editing", "testing", ...)
    pub activity: Option<String>,
    /// Editor playhead on the beatmap timeline
    pub cursor_time: Option<Millis>,
    pub selection: Vec<EntityId>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn with_cursor(mut self, time: Millis) -> Self {
        self.cursor_time = Some(time);
        self
    }

    pub fn with_selection(mut self, selection: impl IntoIterator<Item = EntityId>) -> Self {
        self.selection = selection.into_iter().collect();
        self
    }

    pub fn is_selected(&self, id: &EntityId) -> bool {
        self.selection.contains(id)
    }
}

/// Why a session left its room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Kicked,
    AccessRevoked,
    /// Its outbound queue filled up
    Lagging,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_builder() {
        let presence = Presence::new()
            .with_activity("editing")
            .with_cursor(1200)
            .with_selection([EntityId::from("a"), EntityId::from("b")]);
        assert_eq!(presence.activity.as_deref(), Some("editing"));
        assert_eq!(presence.cursor_time, Some(1200));
        assert!(presence.is_selected(&EntityId::from("b")));
        assert!(!presence.is_selected(&EntityId::from("c")));
    }
}
