//! Per-subscription tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every client subscription of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Maximum number of decoded items (main + reorg combined) queued for a
    /// consumer that is not reading. One more fails the subscription.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Upper bound for the server-side `*_unsubscribe` call, in milliseconds.
    #[serde(default = "default_unsubscribe_timeout_ms")]
    pub unsubscribe_timeout_ms: u64,
}

fn default_max_queue() -> usize { 20_000 }
fn default_unsubscribe_timeout_ms() -> u64 { 5_000 }

impl SubscriptionConfig {
    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_timeout_ms)
    }

    /// Same config with a different queue bound.
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
            unsubscribe_timeout_ms: default_unsubscribe_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: SubscriptionConfig = serde_json::from_str(r#"{"max_queue": 64}"#).unwrap();
        assert_eq!(cfg.max_queue, 64);
        assert_eq!(cfg.unsubscribe_timeout(), Duration::from_secs(5));
    }
}
