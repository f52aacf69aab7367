//! The `RpcTransport` trait: request/response access to a node.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// The central async trait every request/response transport implements.
///
/// Multiplexing transports (e.g. a WebSocket connection) own request-id
/// allocation and are free to overwrite `req.id` before sending.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`;
/// the generic [`RpcTransport::call`] helper is only available on sized types.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;

    /// Call a method and return the raw result value.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let resp = self.send(JsonRpcRequest::new(0, method, params)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }

    /// Convenience: call a method and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(TransportError::Json)
    }
}
