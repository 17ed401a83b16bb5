use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by client sessions and rooms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Undo steps kept per session
    pub history_capacity: usize,
    /// Records closer together than this join the open transaction
    pub merge_window_ms: u64,
    /// How often a client transport drains the outgoing buffer
    pub flush_interval_ms: u64,
    /// Room persistence tick
    pub persist_interval_ms: u64,
    /// Upper bound on one encoded batch or message
    pub max_batch_bytes: u64,
    /// Messages queued per session before the room drops it as lagging
    pub outbound_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            merge_window_ms: 500,
            flush_interval_ms: 50,
            persist_interval_ms: 5_000,
            max_batch_bytes: 1024 * 1024,
            outbound_queue: 1024,
        }
    }
}

impl SyncConfig {
    pub fn merge_window(&self) -> Duration {
        Duration::from_millis(self.merge_window_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"history_capacity": 10}"#).unwrap();
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.merge_window(), Duration::from_millis(500));
        assert_eq!(config.max_batch_bytes, 1024 * 1024);
        assert_eq!(config.outbound_queue, 1024);
    }
}
