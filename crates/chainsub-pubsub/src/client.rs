//! Client-side subscription forwarding.
//!
//! Every [`ClientSubscription`] owns one background task. The dispatcher hands
//! it raw notification payloads through [`ClientSubscription::deliver`]; the
//! task decodes each payload as the main element type or, failing that, as the
//! reorg element type, queues it, and feeds the consumer's channels at the
//! consumer's pace.
//!
//! ```text
//! dispatcher ──deliver──▶ in ──▶ [decode] ──▶ main queue ──▶ consumer main channel
//!                                        └──▶ reorg queue ─▶ consumer reorg channel
//! unsubscribe()/close() ─▶ quit
//! ```
//!
//! Queued reorg items always go out before queued main items. The two queues
//! share one bound ([`SubscriptionConfig::max_queue`]); a consumer that falls
//! further behind than that kills its own subscription with
//! [`SubscriptionError::QueueOverflow`], never the connection.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use chainsub_core::RpcTransport;
use parking_lot::Mutex;
use serde::de::{DeserializeOwned, Error as _, IgnoredAny};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::config::SubscriptionConfig;
use crate::error::SubscriptionError;
use crate::id::SubscriptionId;
use crate::unsubscribe;

/// Reason the forwarding task is asked to stop.
pub(crate) enum Quit {
    /// The user called `unsubscribe()`.
    Unsubscribe,
    /// The connection (or the whole client) went away.
    Closed(SubscriptionError),
}

pub(crate) struct Shared {
    pub(crate) namespace: String,
    id: OnceLock<SubscriptionId>,
    in_tx: mpsc::Sender<Value>,
    pub(crate) quit_tx: mpsc::Sender<Quit>,
    /// Closed (never written) once teardown is complete.
    pub(crate) unsub_done: watch::Receiver<()>,
    /// Taken exactly once by `unsubscribe()`; dropping it closes the error channel.
    pub(crate) err_tx: Mutex<Option<mpsc::Sender<SubscriptionError>>>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<SubscriptionError>>,
    /// The forwarding task before `run()` starts it.
    pub(crate) forwarder: Mutex<Option<Box<dyn Forward>>>,
}

/// Handle to one client subscription. Cheap to clone; all clones refer to the
/// same forwarding task.
#[derive(Clone)]
pub struct ClientSubscription {
    pub(crate) shared: Arc<Shared>,
}

impl ClientSubscription {
    /// Subscription whose notifications all decode as `T`.
    ///
    /// `transport` is used for the server-side `<namespace>_unsubscribe` call.
    pub fn new<T>(
        namespace: impl Into<String>,
        channel: mpsc::Sender<T>,
        transport: Arc<dyn RpcTransport>,
        config: SubscriptionConfig,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        Self::build::<T, IgnoredAny>(namespace.into(), channel, None, transport, config)
    }

    /// Subscription multiplexing ordinary notifications (`T`) and chain
    /// reorganization events (`R`) on one id.
    ///
    /// Payloads are tried as `T` first, so `T` must not accept reorg payloads.
    pub fn with_reorg<T, R>(
        namespace: impl Into<String>,
        channel: mpsc::Sender<T>,
        reorg_channel: mpsc::Sender<R>,
        transport: Arc<dyn RpcTransport>,
        config: SubscriptionConfig,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        Self::build(namespace.into(), channel, Some(reorg_channel), transport, config)
    }

    fn build<T, R>(
        namespace: String,
        main_tx: mpsc::Sender<T>,
        reorg_tx: Option<mpsc::Sender<R>>,
        transport: Arc<dyn RpcTransport>,
        config: SubscriptionConfig,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let (done_tx, unsub_done) = watch::channel(());
        let (err_tx, err_rx) = mpsc::channel(1);

        let forwarder = Forwarder {
            namespace: namespace.clone(),
            config,
            transport,
            main_tx,
            reorg_tx,
            in_rx,
            quit_rx,
            err_tx: err_tx.clone(),
            done_tx,
        };

        Self {
            shared: Arc::new(Shared {
                namespace,
                id: OnceLock::new(),
                in_tx,
                quit_tx,
                unsub_done,
                err_tx: Mutex::new(Some(err_tx)),
                err_rx: tokio::sync::Mutex::new(err_rx),
                forwarder: Mutex::new(Some(Box::new(forwarder))),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// The server-assigned id, once the subscribe call succeeded.
    pub fn id(&self) -> Option<&SubscriptionId> {
        self.shared.id.get()
    }

    pub fn is_confirmed(&self) -> bool {
        self.shared.id.get().is_some()
    }

    /// Confirm the subscription under `id` and start forwarding.
    ///
    /// Called once by the transport after the subscribe call returned; later
    /// calls are ignored. Must be called from within a Tokio runtime.
    pub fn run(&self, id: SubscriptionId) {
        let Some(forwarder) = self.shared.forwarder.lock().take() else {
            tracing::debug!(namespace = %self.shared.namespace, id = %id, "subscription already started");
            return;
        };
        let _ = self.shared.id.set(id.clone());
        tracing::debug!(namespace = %self.shared.namespace, id = %id, "subscription confirmed");
        forwarder.spawn(id);
    }

    /// Hand a raw notification payload to the forwarding task.
    ///
    /// Returns `false` once the task has stopped; the dispatcher should then
    /// forget this subscription.
    pub async fn deliver(&self, raw: Value) -> bool {
        self.shared.in_tx.send(raw).await.is_ok()
    }

    /// Stop forwarding because the connection failed or the client closed.
    /// No server-side unsubscribe is attempted. No-op once stopped.
    pub async fn close(&self, err: SubscriptionError) {
        let _ = self.shared.quit_tx.send(Quit::Closed(err)).await;
    }

    /// Wait for the subscription's final error.
    ///
    /// Returns `Some` at most once, when the subscription failed. Returns
    /// `None` once the subscription has terminated without an error (an
    /// unsubscribe or a whole-client shutdown), and after the failure has
    /// already been taken. Pending while the subscription is still live.
    pub async fn err(&self) -> Option<SubscriptionError> {
        let mut err_rx = self.shared.err_rx.lock().await;
        tokio::select! {
            biased;
            err = err_rx.recv() => err,
            // the task publishes its error before it signals termination
            _ = self.stopped() => err_rx.try_recv().ok(),
        }
    }

    /// Resolves once the forwarding task has finished its teardown.
    pub async fn stopped(&self) {
        // unsub_done is never written, only closed
        let mut done = self.shared.unsub_done.clone();
        while done.changed().await.is_ok() {}
    }

    /// Whether the forwarding task has finished its teardown.
    pub fn is_stopped(&self) -> bool {
        self.shared.unsub_done.has_changed().is_err()
    }
}

impl std::fmt::Debug for ClientSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSubscription")
            .field("namespace", &self.shared.namespace)
            .field("id", &self.shared.id.get())
            .finish()
    }
}

/// Type-erased forwarding task, so the handle does not carry `T`/`R`.
pub(crate) trait Forward: Send {
    fn spawn(self: Box<Self>, id: SubscriptionId);
}

struct Forwarder<T, R> {
    namespace: String,
    config: SubscriptionConfig,
    transport: Arc<dyn RpcTransport>,
    main_tx: mpsc::Sender<T>,
    reorg_tx: Option<mpsc::Sender<R>>,
    in_rx: mpsc::Receiver<Value>,
    quit_rx: mpsc::Receiver<Quit>,
    err_tx: mpsc::Sender<SubscriptionError>,
    done_tx: watch::Sender<()>,
}

impl<T, R> Forward for Forwarder<T, R>
where
    T: DeserializeOwned + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    fn spawn(self: Box<Self>, id: SubscriptionId) {
        tokio::spawn(self.run(id));
    }
}

impl<T, R> Forwarder<T, R>
where
    T: DeserializeOwned + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    async fn run(self: Box<Self>, id: SubscriptionId) {
        let Forwarder {
            namespace,
            config,
            transport,
            main_tx,
            reorg_tx,
            mut in_rx,
            mut quit_rx,
            err_tx,
            done_tx,
        } = *self;

        let (unsubscribe_server, err) = forward(
            &main_tx,
            reorg_tx.as_ref(),
            &mut in_rx,
            &mut quit_rx,
            config.max_queue,
        )
        .await;
        drop(main_tx);
        drop(reorg_tx);

        // Stop accepting first: a dispatcher blocked in deliver()/close() is
        // released before we call back into it for the unsubscribe.
        drop(in_rx);
        drop(quit_rx);

        if unsubscribe_server {
            unsubscribe::unsubscribe_server(
                &*transport,
                &namespace,
                &id,
                config.unsubscribe_timeout(),
            )
            .await;
        }

        match err {
            Some(err) if err.is_client_shutdown() => {
                tracing::debug!(namespace = %namespace, id = %id, "subscription closed with client");
            }
            Some(err) => {
                tracing::debug!(namespace = %namespace, id = %id, error = %err, "subscription failed");
                let _ = err_tx.try_send(err);
            }
            None => {
                tracing::debug!(namespace = %namespace, id = %id, "subscription stopped");
            }
        }

        drop(err_tx);
        drop(done_tx);
    }
}

/// Decoded payload, tagged with the stream it belongs to.
enum Decoded<T, R> {
    Main(T),
    Reorg(R),
}

/// The forwarding loop. Returns whether the server should be told to
/// unsubscribe, and the error that ended the subscription, if any.
async fn forward<T, R>(
    main_tx: &mpsc::Sender<T>,
    reorg_tx: Option<&mpsc::Sender<R>>,
    in_rx: &mut mpsc::Receiver<Value>,
    quit_rx: &mut mpsc::Receiver<Quit>,
    max_queue: usize,
) -> (bool, Option<SubscriptionError>)
where
    T: DeserializeOwned,
    R: DeserializeOwned,
{
    let mut main_queue: VecDeque<T> = VecDeque::new();
    let mut reorg_queue: VecDeque<R> = VecDeque::new();

    loop {
        let send_reorg = !reorg_queue.is_empty();
        let send_main = !send_reorg && !main_queue.is_empty();

        tokio::select! {
            biased;

            quit = quit_rx.recv() => {
                return match quit {
                    Some(Quit::Closed(err)) => (false, Some(err)),
                    // every handle is gone: nobody is left to unsubscribe
                    Some(Quit::Unsubscribe) | None => (true, None),
                };
            }

            permit = reserve(reorg_tx), if send_reorg => match permit {
                Ok(permit) => {
                    if let Some(item) = reorg_queue.pop_front() {
                        permit.send(item);
                    }
                }
                Err(_) => return (true, None),
            },

            permit = main_tx.reserve(), if send_main => match permit {
                Ok(permit) => {
                    if let Some(item) = main_queue.pop_front() {
                        permit.send(item);
                    }
                }
                Err(_) => return (true, None),
            },

            raw = in_rx.recv() => {
                let Some(raw) = raw else {
                    return (true, None);
                };
                let item = match decode::<T, R>(&raw, reorg_tx.is_some()) {
                    Ok(item) => item,
                    Err(err) => return (true, Some(err)),
                };
                if main_queue.len() + reorg_queue.len() >= max_queue {
                    return (true, Some(SubscriptionError::QueueOverflow { max: max_queue }));
                }
                match item {
                    Decoded::Main(v) => main_queue.push_back(v),
                    Decoded::Reorg(v) => reorg_queue.push_back(v),
                }
            }
        }
    }
}

/// `reserve()` on an optional channel; pending forever when there is none.
async fn reserve<U>(
    tx: Option<&mpsc::Sender<U>>,
) -> Result<mpsc::Permit<'_, U>, mpsc::error::SendError<()>> {
    match tx {
        Some(tx) => tx.reserve().await,
        None => std::future::pending().await,
    }
}

fn decode<T, R>(raw: &Value, with_reorg: bool) -> Result<Decoded<T, R>, SubscriptionError>
where
    T: DeserializeOwned,
    R: DeserializeOwned,
{
    let main = match strict_from_value::<T>(raw) {
        Ok(v) => return Ok(Decoded::Main(v)),
        Err(e) => e,
    };
    if !with_reorg {
        return Err(SubscriptionError::Decode { main, reorg: None });
    }
    match strict_from_value::<R>(raw) {
        Ok(v) => Ok(Decoded::Reorg(v)),
        Err(reorg) => Err(SubscriptionError::Decode {
            main,
            reorg: Some(reorg),
        }),
    }
}

/// Deserialize `raw` as `T`, rejecting fields `T` does not know.
fn strict_from_value<T: DeserializeOwned>(raw: &Value) -> Result<T, serde_json::Error> {
    let mut unknown = Vec::new();
    let value = serde_ignored::deserialize(raw, |path| unknown.push(path.to_string()))?;
    if unknown.is_empty() {
        Ok(value)
    } else {
        Err(serde_json::Error::custom(format!(
            "unknown field(s): {}",
            unknown.join(", ")
        )))
    }
}
