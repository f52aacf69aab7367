//! chainsub-core: wire types and transport abstraction for chainsub.
//!
//! # Overview
//!
//! The core crate defines what every other chainsub crate speaks:
//!
//! - [`RpcTransport`]: the async trait a request/response transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: JSON-RPC 2.0 wire types
//! - [`TransportError`]: structured transport error

pub mod error;
pub mod request;
pub mod transport;

pub use error::TransportError;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use transport::RpcTransport;
