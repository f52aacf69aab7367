//! chainsub-pubsub: the subscription half of chainsub.
//!
//! # Server side
//! - [`IdGenerator`] / [`SubscriptionId`]: opaque, hard-to-guess ids
//! - [`Notifier`]: holds notifications back until the subscription id has
//!   reached the client, then passes them straight through
//! - [`ServerSubscriptions`]: per-connection registry answering `*_unsubscribe`
//!
//! # Client side
//! - [`ClientSubscription`]: one forwarding task per subscription that
//!   decodes pushed payloads into a main stream and an optional reorg stream,
//!   queues them for a slow consumer and tears down cleanly
//!
//! Both sides agree on the notification envelope in [`message`].

pub mod client;
pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod notifier;
pub mod registry;
mod unsubscribe;

pub use client::ClientSubscription;
pub use config::SubscriptionConfig;
pub use error::SubscriptionError;
pub use id::{IdGenerator, SubscriptionId};
pub use message::{SubscriptionNotification, SubscriptionParams};
pub use notifier::{NotificationWriter, Notifier, Subscription};
pub use registry::ServerSubscriptions;
