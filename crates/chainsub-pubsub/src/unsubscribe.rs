//! Tearing a client subscription down.

use std::time::Duration;

use chainsub_core::RpcTransport;
use serde_json::Value;

use crate::client::{ClientSubscription, Quit};
use crate::id::SubscriptionId;

impl ClientSubscription {
    /// Stop the subscription and wait until its forwarding task is gone.
    ///
    /// Safe to call any number of times from any number of tasks; every call
    /// returns only after teardown finished. The first call to get there
    /// closes the error channel, so a later [`err`](Self::err) yields the
    /// failure (if one was recorded) and then `None`.
    pub async fn unsubscribe(&self) {
        let shared = &self.shared;

        // never started: dropping the parked task completes teardown
        let parked = shared.forwarder.lock().take();
        drop(parked);

        // The task may already be gone (connection closed under us), in which
        // case the quit send would wait forever without the second branch.
        let mut done = shared.unsub_done.clone();
        tokio::select! {
            _ = shared.quit_tx.send(Quit::Unsubscribe) => {}
            _ = done.changed() => {}
        }

        self.stopped().await;

        if shared.err_tx.lock().take().is_some() {
            tracing::debug!(namespace = %shared.namespace, id = ?self.id(), "subscription error channel closed");
        }
    }
}

/// Best-effort `<namespace>_unsubscribe` call. The client side is already torn
/// down, so failures are only logged.
pub(crate) async fn unsubscribe_server(
    transport: &dyn RpcTransport,
    namespace: &str,
    id: &SubscriptionId,
    timeout: Duration,
) {
    let method = format!("{namespace}_unsubscribe");
    let call = transport.request(&method, vec![Value::String(id.to_string())]);

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(_)) => {
            tracing::debug!(%method, id = %id, "server subscription removed");
        }
        Ok(Err(e)) if e.is_connection_error() => {
            tracing::debug!(%method, id = %id, error = %e, "connection gone before server unsubscribe");
        }
        Ok(Err(e)) => {
            tracing::warn!(%method, id = %id, error = %e, "server unsubscribe failed");
        }
        Err(_) => {
            tracing::warn!(
                %method,
                id = %id,
                timeout_ms = timeout.as_millis() as u64,
                "server unsubscribe timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chainsub_core::{JsonRpcRequest, JsonRpcResponse, TransportError};

    struct Stalled;

    #[async_trait]
    impl RpcTransport for Stalled {
        async fn send(&self, _req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            std::future::pending().await
        }

        fn url(&self) -> &str {
            "stalled"
        }
    }

    struct Rejecting;

    #[async_trait]
    impl RpcTransport for Rejecting {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            Ok(JsonRpcResponse::failure(req.id, -32000, "subscription not found"))
        }

        fn url(&self) -> &str {
            "rejecting"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn server_call_is_bounded_by_timeout() {
        let started = tokio::time::Instant::now();
        unsubscribe_server(&Stalled, "eth", &SubscriptionId::from("0x1"), Duration::from_secs(5)).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn server_rejection_is_swallowed() {
        unsubscribe_server(&Rejecting, "eth", &SubscriptionId::from("0x1"), Duration::from_secs(1)).await;
    }
}
