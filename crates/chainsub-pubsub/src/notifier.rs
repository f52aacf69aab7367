//! Server-side notification gate.
//!
//! A [`Notifier`] lives for the duration of one subscribing call. The handler
//! creates the subscription and may start notifying immediately, but nothing
//! reaches the wire until the transport has flushed the call's response (the
//! subscription id) and called [`Notifier::activate`]. That keeps "you are
//! subscribed as X" ahead of "here is data for X" on the client.
//!
//! Misuse (creating twice, creating after the call returned, notifying an id
//! that was never created) is a bug in the server code and panics.

use std::sync::Arc;

use chainsub_core::TransportError;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::id::SubscriptionId;
use crate::message::SubscriptionNotification;

/// Synchronous sink for outgoing notifications (the write half of a
/// connection).
pub trait NotificationWriter: Send + Sync {
    fn write_notification(&self, msg: &SubscriptionNotification) -> Result<(), TransportError>;
}

/// Text frames for a connection writer task.
impl NotificationWriter for mpsc::UnboundedSender<String> {
    fn write_notification(&self, msg: &SubscriptionNotification) -> Result<(), TransportError> {
        let text = serde_json::to_string(msg)?;
        self.send(text)
            .map_err(|_| TransportError::WebSocket("connection writer closed".into()))
    }
}

/// Server-visible handle of a live subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    namespace: String,
    done: Arc<watch::Sender<bool>>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, namespace: &str) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            namespace: namespace.to_string(),
            done: Arc::new(done),
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolves once the client unsubscribed or the connection went away.
    /// Producers select on this to stop publishing.
    pub async fn unsubscribed(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_unsubscribed(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) fn mark_unsubscribed(&self) {
        self.done.send_replace(true);
    }
}

#[derive(Default)]
struct NotifierState {
    call_returned: bool,
    active: bool,
    sub: Option<Subscription>,
    buffer: Vec<Value>,
}

/// Defers notifications for one subscription until it is activated.
pub struct Notifier {
    namespace: String,
    writer: Arc<dyn NotificationWriter>,
    state: Mutex<NotifierState>,
}

impl Notifier {
    pub fn new(namespace: impl Into<String>, writer: Arc<dyn NotificationWriter>) -> Self {
        Self {
            namespace: namespace.into(),
            writer,
            state: Mutex::new(NotifierState::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create the subscription for this call. Allowed once, and only while
    /// the subscribing call has not yet returned.
    pub fn create_subscription(&self) -> Subscription {
        let mut state = self.state.lock();
        assert!(
            !state.call_returned,
            "create_subscription called after the subscribing call returned"
        );
        assert!(state.sub.is_none(), "create_subscription called twice");

        let sub = Subscription::new(SubscriptionId::new_random(), &self.namespace);
        tracing::debug!(namespace = %self.namespace, id = %sub.id, "subscription created");
        state.sub = Some(sub.clone());
        sub
    }

    /// Send `payload` to the client for subscription `id`.
    ///
    /// Before activation the payload is buffered and this always succeeds.
    /// Afterwards it is written directly; an error means the connection is
    /// no longer usable.
    pub fn notify<P: Serialize>(&self, id: &SubscriptionId, payload: &P) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let sub_id = match &state.sub {
            Some(sub) => sub.id.clone(),
            None => panic!("notify called before create_subscription"),
        };
        assert_eq!(&sub_id, id, "notify called with an id this notifier did not create");

        let value = serde_json::to_value(payload)?;
        if state.active {
            self.send(&sub_id, value)
        } else {
            state.buffer.push(value);
            Ok(())
        }
    }

    /// Mark the subscribing call as returned. Returns the subscription the
    /// transport must [`activate`](Self::activate) once the response is
    /// flushed, if one was created.
    pub fn finish_call(&self) -> Option<Subscription> {
        let mut state = self.state.lock();
        state.call_returned = true;
        state.sub.clone()
    }

    /// Flush buffered notifications in order and switch to pass-through.
    /// Must only be called after the subscription id reached the client.
    pub fn activate(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(id) = state.sub.as_ref().map(|sub| sub.id.clone()) else {
            return Ok(());
        };

        let buffered = std::mem::take(&mut state.buffer);
        tracing::debug!(namespace = %self.namespace, id = %id, buffered = buffered.len(), "activating subscription");
        for value in buffered {
            self.send(&id, value)?;
        }
        state.active = true;
        Ok(())
    }

    fn send(&self, id: &SubscriptionId, value: Value) -> Result<(), TransportError> {
        let msg = SubscriptionNotification::new(&self.namespace, id.clone(), value);
        self.writer.write_notification(&msg)
    }
}
