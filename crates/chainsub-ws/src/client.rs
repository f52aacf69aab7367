//! WebSocket JSON-RPC client: request multiplexing plus typed subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use chainsub_core::error::TransportError;
use chainsub_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use chainsub_core::transport::RpcTransport;
use chainsub_pubsub::message::{is_notification_method, SubscriptionNotification};
use chainsub_pubsub::{ClientSubscription, SubscriptionConfig, SubscriptionError, SubscriptionId};

type Reply = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type SubscribeReply = oneshot::Sender<Result<(), SubscriptionError>>;

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Reconnect backoff starting duration.
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max: Duration,
    /// Applied to every subscription opened through this client.
    pub subscription: SubscriptionConfig,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
            subscription: SubscriptionConfig::default(),
        }
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: Reply,
    },
    Subscribe {
        req: JsonRpcRequest,
        sub: ClientSubscription,
        tx: SubscribeReply,
    },
    ActiveSubscriptions(oneshot::Sender<usize>),
    Close,
}

/// A request waiting for its response.
enum Pending {
    Call(Reply),
    Subscribe {
        sub: ClientSubscription,
        tx: SubscribeReply,
    },
}

/// Request side of the connection. Subscriptions hold a clone of this for
/// their unsubscribe call, so it must not keep the client itself alive.
#[derive(Clone)]
struct CommandSender {
    url: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    next_id: Arc<AtomicU64>,
}

impl CommandSender {
    fn next_request(&self, method: &str, params: Vec<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params)
    }
}

#[async_trait]
impl RpcTransport for CommandSender {
    async fn send(&self, mut req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        req.id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { req, tx })
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// WebSocket JSON-RPC client.
///
/// A background task owns the connection: it multiplexes requests, routes
/// pushed notifications to their [`ClientSubscription`] and reconnects with
/// exponential backoff. Subscriptions do not survive a disconnect; they end
/// with the connection error and must be re-opened by the caller.
pub struct WsRpcClient {
    requests: CommandSender,
    config: WsClientConfig,
}

impl WsRpcClient {
    /// Connect to `url` and start the background task.
    pub async fn connect(
        url: impl Into<String>,
        config: WsClientConfig,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let url_clone = url.clone();
        let backoff = (config.reconnect_initial, config.reconnect_max);

        tokio::spawn(async move {
            ws_task(url_clone, cmd_rx, backoff).await;
        });

        Ok(Self {
            requests: CommandSender {
                url: url.into(),
                cmd_tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            config,
        })
    }

    /// Subscribe via `<namespace>_subscribe(kind, ..params)`.
    ///
    /// Notifications are decoded as `T` and sent to `channel`. Read them
    /// promptly: see [`SubscriptionConfig::max_queue`].
    pub async fn subscribe<T>(
        &self,
        namespace: &str,
        kind: &str,
        params: Vec<Value>,
        channel: mpsc::Sender<T>,
    ) -> Result<ClientSubscription, SubscriptionError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let sub = ClientSubscription::new(
            namespace,
            channel,
            Arc::new(self.requests.clone()),
            self.config.subscription.clone(),
        );
        self.start(sub, kind, params).await
    }

    /// Like [`subscribe`](Self::subscribe), for streams that also carry
    /// chain reorganization events decoded as `R`.
    pub async fn subscribe_with_reorg<T, R>(
        &self,
        namespace: &str,
        kind: &str,
        params: Vec<Value>,
        channel: mpsc::Sender<T>,
        reorg_channel: mpsc::Sender<R>,
    ) -> Result<ClientSubscription, SubscriptionError>
    where
        T: DeserializeOwned + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let sub = ClientSubscription::with_reorg(
            namespace,
            channel,
            reorg_channel,
            Arc::new(self.requests.clone()),
            self.config.subscription.clone(),
        );
        self.start(sub, kind, params).await
    }

    async fn start(
        &self,
        sub: ClientSubscription,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<ClientSubscription, SubscriptionError> {
        let method = format!("{}_subscribe", sub.namespace());
        let req = self.requests.next_request(
            &method,
            std::iter::once(Value::String(kind.to_string()))
                .chain(params)
                .collect(),
        );

        let (tx, rx) = oneshot::channel();
        self.requests
            .cmd_tx
            .send(WsCommand::Subscribe { req, sub: sub.clone(), tx })
            .map_err(|_| SubscriptionError::ClientShutdown)?;
        rx.await.map_err(|_| SubscriptionError::ClientShutdown)??;
        Ok(sub)
    }

    /// Number of subscriptions currently routed on this connection.
    pub async fn active_subscriptions(&self) -> Result<usize, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .cmd_tx
            .send(WsCommand::ActiveSubscriptions(tx))
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Close the connection. Every open subscription ends without error and
    /// in-flight requests fail with [`TransportError::Closed`].
    pub fn close(&self) {
        let _ = self.requests.cmd_tx.send(WsCommand::Close);
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.requests.send(req).await
    }

    fn url(&self) -> &str {
        self.requests.url()
    }
}

/// Connection-local routing state.
struct Router {
    pending: HashMap<u64, Pending>,
    subs: HashMap<SubscriptionId, ClientSubscription>,
    /// Ids whose forwarding task has stopped.
    stopped_tx: mpsc::UnboundedSender<SubscriptionId>,
}

impl Router {
    fn new(stopped_tx: mpsc::UnboundedSender<SubscriptionId>) -> Self {
        Self {
            pending: HashMap::new(),
            subs: HashMap::new(),
            stopped_tx,
        }
    }

    fn track(&mut self, id: SubscriptionId, sub: ClientSubscription) {
        let watched = sub.clone();
        let stopped_tx = self.stopped_tx.clone();
        let stopped_id = id.clone();
        tokio::spawn(async move {
            watched.stopped().await;
            let _ = stopped_tx.send(stopped_id);
        });
        self.subs.insert(id, sub);
    }

    /// Drop the route for `id` if its subscription has stopped. A live
    /// subscription under the same id (after a reconnect) is kept.
    fn forget(&mut self, id: &SubscriptionId) {
        if self.subs.get(id).is_some_and(ClientSubscription::is_stopped) {
            tracing::debug!(id = %id, "subscription stopped, forgetting it");
            self.subs.remove(id);
        }
    }

    async fn handle_message(&mut self, text: &str) {
        let Ok(val) = serde_json::from_str::<Value>(text) else {
            tracing::debug!("failed to parse WS message as JSON");
            return;
        };

        let is_notification = val
            .get("method")
            .and_then(Value::as_str)
            .is_some_and(is_notification_method);
        if is_notification {
            match serde_json::from_value::<SubscriptionNotification>(val) {
                Ok(msg) => self.dispatch(msg).await,
                Err(e) => tracing::debug!(error = %e, "malformed subscription notification"),
            }
            return;
        }

        match serde_json::from_value::<JsonRpcResponse>(val) {
            Ok(resp) => self.resolve(resp),
            Err(e) => tracing::debug!(error = %e, "unrecognised WS message"),
        }
    }

    async fn dispatch(&mut self, msg: SubscriptionNotification) {
        let id = msg.params.subscription;
        let Some(sub) = self.subs.get(&id) else {
            tracing::debug!(id = %id, method = %msg.method, "notification for unknown subscription");
            return;
        };
        if !sub.deliver(msg.params.result).await {
            tracing::debug!(id = %id, "subscription stopped, forgetting it");
            self.subs.remove(&id);
        }
    }

    fn resolve(&mut self, resp: JsonRpcResponse) {
        let Some(pending) = resp.id.as_u64().and_then(|id| self.pending.remove(&id)) else {
            tracing::debug!(id = %resp.id, "response for unknown request");
            return;
        };

        match pending {
            Pending::Call(tx) => {
                let _ = tx.send(Ok(resp));
            }
            Pending::Subscribe { sub, tx } => {
                let result = match resp.into_result() {
                    Ok(Value::String(id)) => {
                        let id = SubscriptionId::from(id);
                        sub.run(id.clone());
                        self.track(id, sub.clone());
                        Ok(())
                    }
                    Ok(other) => Err(SubscriptionError::Transport(TransportError::Other(
                        format!("invalid subscription id: {other}"),
                    ))),
                    Err(e) => match TransportError::Rpc(e) {
                        e if e.is_method_not_found() => {
                            Err(SubscriptionError::NotificationsUnsupported)
                        }
                        e => Err(SubscriptionError::Transport(e)),
                    },
                };
                let started = result.is_ok();
                if tx.send(result).is_err() && started {
                    // caller went away before seeing the id
                    tokio::spawn(async move { sub.unsubscribe().await });
                }
            }
        }
    }

    /// Fail everything in flight and end every subscription.
    async fn fail_all(&mut self, err: impl Fn() -> TransportError, shutdown: bool) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Call(tx) => {
                    let _ = tx.send(Err(err()));
                }
                Pending::Subscribe { tx, .. } => {
                    let _ = tx.send(Err(err().into()));
                }
            }
        }

        for (id, sub) in self.subs.drain() {
            tracing::debug!(id = %id, "closing subscription with connection");
            let reason = if shutdown {
                SubscriptionError::ClientShutdown
            } else {
                SubscriptionError::Transport(err())
            };
            sub.close(reason).await;
        }
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    (reconnect_initial, reconnect_max): (Duration, Duration),
) {
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let mut router = Router::new(stopped_tx);
    let mut backoff = reconnect_initial;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(reconnect_max);
                continue;
            }
        };
        backoff = reconnect_initial;
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let (req, pending) = match cmd {
                        None | Some(WsCommand::Close) => {
                            let _ = sink.close().await;
                            router.fail_all(|| TransportError::Closed, true).await;
                            tracing::info!(url = %url, "WS client closed");
                            return;
                        }
                        Some(WsCommand::ActiveSubscriptions(tx)) => {
                            let _ = tx.send(router.subs.len());
                            continue;
                        }
                        Some(WsCommand::Send { req, tx }) => (req, Pending::Call(tx)),
                        Some(WsCommand::Subscribe { req, sub, tx }) => {
                            (req, Pending::Subscribe { sub, tx })
                        }
                    };
                    let Some(id) = req.id.as_u64() else {
                        tracing::debug!(id = %req.id, "dropping request without numeric id");
                        continue;
                    };
                    let msg = match serde_json::to_string(&req) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::debug!(error = %e, "failed to encode request");
                            continue;
                        }
                    };
                    router.pending.insert(id, pending);
                    if sink.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Some(id) = stopped_rx.recv() => router.forget(&id),
                msg = stream.next() => {
                    match msg {
                        None => break,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WS receive error");
                            break;
                        }
                        Some(Ok(Message::Text(text))) => {
                            router.handle_message(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) => break,
                        _ => {}
                    }
                }
            }
        }

        router
            .fail_all(|| TransportError::WebSocket("connection lost".into()), false)
            .await;
        tracing::warn!(url = %url, "WS disconnected, reconnecting in {backoff:?}");
        time::sleep(backoff).await;
        backoff = (backoff * 2).min(reconnect_max);
    }
}
