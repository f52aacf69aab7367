//! Server-side registry of live subscriptions on one connection.
//!
//! Answers `*_unsubscribe` calls and releases every subscription when the
//! connection goes away, so producers waiting on
//! [`Subscription::unsubscribed`] stop publishing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::SubscriptionError;
use crate::id::SubscriptionId;
use crate::notifier::Subscription;

/// Live subscriptions keyed by id.
#[derive(Clone, Default)]
pub struct ServerSubscriptions {
    entries: Arc<Mutex<HashMap<SubscriptionId, Subscription>>>,
}

impl ServerSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription once its notifier has been activated.
    pub fn insert(&self, sub: Subscription) {
        self.entries.lock().insert(sub.id().clone(), sub);
    }

    /// Drop the subscription and signal its producer.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), SubscriptionError> {
        let sub = self
            .entries
            .lock()
            .remove(id)
            .ok_or(SubscriptionError::NotFound)?;
        tracing::debug!(namespace = %sub.namespace(), id = %id, "client unsubscribed");
        sub.mark_unsubscribed();
        Ok(())
    }

    /// Handle the positional params of a `*_unsubscribe` call: `[id]`.
    /// The JSON result of a successful call is `true`.
    pub fn handle_unsubscribe(&self, params: &[Value]) -> Result<Value, SubscriptionError> {
        let id = params
            .first()
            .and_then(Value::as_str)
            .map(SubscriptionId::from)
            .ok_or(SubscriptionError::NotFound)?;
        self.unsubscribe(&id)?;
        Ok(Value::Bool(true))
    }

    /// Release everything, e.g. when the connection closed.
    pub fn close_all(&self) {
        let drained: Vec<Subscription> = self.entries.lock().drain().map(|(_, s)| s).collect();
        for sub in drained {
            sub.mark_unsubscribed();
        }
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
