//! chainsub-ws: WebSocket JSON-RPC transport with typed subscriptions.
//!
//! # Features
//! - Request multiplexing over a single connection
//! - `<ns>_subscribe` / `<ns>_unsubscribe` with one forwarding task per
//!   subscription (see [`chainsub_pubsub::ClientSubscription`])
//! - Main and chain-reorg event streams on one subscription id
//! - Auto-reconnect on disconnect (exponential backoff); open subscriptions
//!   end with the connection error instead of being replayed

pub mod client;

pub use client::{WsClientConfig, WsRpcClient};
