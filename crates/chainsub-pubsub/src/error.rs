//! Subscription error types.

use chainsub_core::TransportError;
use thiserror::Error;

/// Why a subscription could not be created or why it ended.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The server (or the transport) has no subscription support.
    #[error("notifications not supported")]
    NotificationsUnsupported,

    /// `*_unsubscribe` referenced an id the server does not know.
    #[error("subscription not found")]
    NotFound,

    /// The consumer fell too far behind.
    #[error("subscription queue overflow (max {max} items)")]
    QueueOverflow { max: usize },

    /// A pushed payload matched neither the main nor the reorg element type.
    #[error("{}", decode_message(.main, .reorg))]
    Decode {
        main: serde_json::Error,
        reorg: Option<serde_json::Error>,
    },

    /// The whole client was closed.
    #[error("client is closed")]
    ClientShutdown,

    /// The connection failed underneath the subscription.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn decode_message(main: &serde_json::Error, reorg: &Option<serde_json::Error>) -> String {
    match reorg {
        Some(reorg) => format!("payload matches neither main type ({main}) nor reorg type ({reorg})"),
        None => format!("payload does not match subscription type: {main}"),
    }
}

impl SubscriptionError {
    /// Returns `true` for the whole-client shutdown, which is not a failure of
    /// any single subscription.
    pub fn is_client_shutdown(&self) -> bool {
        matches!(self, Self::ClientShutdown | Self::Transport(TransportError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_keeps_both_causes() {
        let main = serde_json::from_str::<u64>("\"x\"").unwrap_err();
        let reorg = serde_json::from_str::<bool>("\"x\"").unwrap_err();
        let msg = SubscriptionError::Decode { main, reorg: Some(reorg) }.to_string();
        assert!(msg.contains("main type"));
        assert!(msg.contains("reorg type"));
    }

    #[test]
    fn transport_closed_counts_as_shutdown() {
        assert!(SubscriptionError::from(TransportError::Closed).is_client_shutdown());
        assert!(!SubscriptionError::QueueOverflow { max: 1 }.is_client_shutdown());
    }
}
