//! The notification envelope pushed by the server for a live subscription.
//!
//! ```text
//! {"jsonrpc":"2.0","method":"<ns>_subscription","params":{"subscription":"0x..","result":<payload>}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::SubscriptionId;

/// Suffix of every notification method name.
pub const NOTIFICATION_SUFFIX: &str = "_subscription";

/// Returns `true` if `method` names a subscription notification.
///
/// Some nodes push differently-typed events under suffixed method names
/// (`starknet_subscriptionReorg`), so this is a substring match.
pub fn is_notification_method(method: &str) -> bool {
    method.contains(NOTIFICATION_SUFFIX)
}

/// `params` of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub subscription: SubscriptionId,
    pub result: Value,
}

/// A server-pushed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: SubscriptionParams,
}

impl SubscriptionNotification {
    pub fn new(namespace: &str, subscription: SubscriptionId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: format!("{namespace}{NOTIFICATION_SUFFIX}"),
            params: SubscriptionParams { subscription, result },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_shape() {
        let n = SubscriptionNotification::new("eth", "0xabc".into(), json!({"number": "0x5"}));
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(
            v,
            json!({
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": {"subscription": "0xabc", "result": {"number": "0x5"}}
            })
        );
    }

    #[test]
    fn notification_methods() {
        assert!(is_notification_method("eth_subscription"));
        assert!(is_notification_method("starknet_subscriptionReorg"));
        assert!(!is_notification_method("eth_subscribe"));
        assert!(!is_notification_method("eth_unsubscribe"));
    }
}
