//! End-to-end tests against an in-process WebSocket node.
//!
//! The test node serves `eth_*` and `starknet_*` subscriptions through a
//! `Notifier`, publishing two headers before the subscription id is flushed
//! and more afterwards, and answers `*_unsubscribe` from a
//! `ServerSubscriptions` registry.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use chainsub_core::error::METHOD_NOT_FOUND;
use chainsub_core::{JsonRpcRequest, JsonRpcResponse, RpcTransport, TransportError};
use chainsub_pubsub::{Notifier, ServerSubscriptions, Subscription, SubscriptionError};
use chainsub_ws::{WsClientConfig, WsRpcClient};

// ─── Test node ────────────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct BlockHeader {
    #[serde(rename = "Number")]
    number: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Reorg {
    starting_block_number: u64,
    ending_block_number: u64,
}

/// Start a node on a random port. Server-side subscriptions are reported on
/// the returned channel once they are live.
async fn spawn_node() -> (String, mpsc::UnboundedReceiver<Subscription>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (live_tx, live_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(serve(tcp, live_tx.clone()));
        }
    });

    (format!("ws://{addr}"), live_rx)
}

async fn serve(tcp: TcpStream, live_tx: mpsc::UnboundedSender<Subscription>) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });
    let registry = ServerSubscriptions::new();

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let req: JsonRpcRequest = serde_json::from_str(text.as_str()).unwrap();

        let resp = match req.method.as_str() {
            "eth_blockNumber" => JsonRpcResponse::success(req.id, json!("0x10")),
            "test_disconnect" => break,
            "eth_subscribe" | "starknet_subscribe" => {
                let namespace = req.method.trim_end_matches("_subscribe").to_string();
                let notifier = Notifier::new(namespace.as_str(), Arc::new(out_tx.clone()));
                let sub = notifier.create_subscription();

                // published while the call is still running: held back
                for n in 1..=2u64 {
                    notifier.notify(sub.id(), &json!({ "Number": n })).unwrap();
                }

                let sub = notifier.finish_call().expect("subscription created");
                let resp = JsonRpcResponse::success(req.id, json!(sub.id()));
                out_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();
                notifier.activate().unwrap();

                if namespace == "starknet" {
                    let reorg = json!({"starting_block_number": 2, "ending_block_number": 2});
                    notifier.notify(sub.id(), &reorg).unwrap();
                }
                notifier.notify(sub.id(), &json!({"Number": 3})).unwrap();

                registry.insert(sub.clone());
                let _ = live_tx.send(sub);
                continue;
            }
            m if m.ends_with("_unsubscribe") => match registry.handle_unsubscribe(&req.params) {
                Ok(result) => JsonRpcResponse::success(req.id, result),
                Err(e) => JsonRpcResponse::failure(req.id, -32000, e.to_string()),
            },
            _ => JsonRpcResponse::failure(req.id, METHOD_NOT_FOUND, "method not found"),
        };
        if out_tx.send(serde_json::to_string(&resp).unwrap()).is_err() {
            break;
        }
    }

    registry.close_all();
    writer.abort();
}

fn config() -> WsClientConfig {
    WsClientConfig {
        reconnect_initial: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(200),
        ..WsClientConfig::default()
    }
}

async fn recv<U>(rx: &mut mpsc::Receiver<U>) -> U {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

async fn wait_for_routes(client: &WsRpcClient, expected: usize) {
    let settled = tokio::time::timeout(WAIT, async {
        while client.active_subscriptions().await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "router still holds stopped subscriptions");
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_calls_are_multiplexed() {
    let (url, _live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (a, b) = tokio::join!(
        client.call::<String>("eth_blockNumber", vec![]),
        client.call::<String>("eth_blockNumber", vec![]),
    );
    assert_eq!(a.unwrap(), "0x10");
    assert_eq!(b.unwrap(), "0x10");
}

#[tokio::test]
async fn subscription_streams_in_order_and_unsubscribes_server() {
    let (url, mut live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<BlockHeader>(1);
    let sub = client.subscribe("eth", "newHeads", vec![], tx).await.unwrap();
    let server_sub = live.recv().await.unwrap();
    assert_eq!(sub.id(), Some(server_sub.id()));

    for n in 1..=3 {
        assert_eq!(recv(&mut rx).await, BlockHeader { number: n });
    }

    tokio::time::timeout(WAIT, sub.unsubscribe()).await.unwrap();
    tokio::time::timeout(WAIT, server_sub.unsubscribed())
        .await
        .expect("server never saw eth_unsubscribe");
    assert!(sub.err().await.is_none());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn unsubscribed_routes_are_forgotten() {
    let (url, mut live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<BlockHeader>(8);
    let first = client.subscribe("eth", "newHeads", vec![], tx).await.unwrap();
    let (tx, _rx2) = mpsc::channel::<BlockHeader>(8);
    let second = client.subscribe("eth", "newHeads", vec![], tx).await.unwrap();
    let _ = live.recv().await.unwrap();
    let _ = live.recv().await.unwrap();
    assert_eq!(client.active_subscriptions().await.unwrap(), 2);

    for n in 1..=3 {
        assert_eq!(recv(&mut rx).await.number, n);
    }
    first.unsubscribe().await;
    wait_for_routes(&client, 1).await;

    second.unsubscribe().await;
    wait_for_routes(&client, 0).await;
}

#[tokio::test]
async fn reorg_events_arrive_on_their_own_channel() {
    let (url, _live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<BlockHeader>(8);
    let (reorg_tx, mut reorg_rx) = mpsc::channel::<Reorg>(8);
    let sub = client
        .subscribe_with_reorg("starknet", "newHeads", vec![], tx, reorg_tx)
        .await
        .unwrap();

    let reorg = recv(&mut reorg_rx).await;
    assert_eq!(reorg, Reorg { starting_block_number: 2, ending_block_number: 2 });
    for n in 1..=3 {
        assert_eq!(recv(&mut rx).await.number, n);
    }

    sub.unsubscribe().await;
    assert!(sub.err().await.is_none());
}

#[tokio::test]
async fn unsupported_namespace_is_reported_at_subscribe_time() {
    let (url, _live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (tx, _rx) = mpsc::channel::<Value>(1);
    let err = client.subscribe("debug", "traces", vec![], tx).await.unwrap_err();
    assert!(matches!(err, SubscriptionError::NotificationsUnsupported));
}

#[tokio::test]
async fn unknown_subscription_id_is_rejected_by_node() {
    let (url, _live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let err = client
        .request("eth_unsubscribe", vec![json!("0xdead")])
        .await
        .unwrap_err();
    match err {
        TransportError::Rpc(e) => assert_eq!(e.message, "subscription not found"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn client_close_ends_subscription_without_error() {
    let (url, _live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<BlockHeader>(8);
    let sub = client.subscribe("eth", "newHeads", vec![], tx).await.unwrap();
    for n in 1..=3 {
        assert_eq!(recv(&mut rx).await.number, n);
    }

    client.close();
    let ended = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert!(ended.is_none());
    let err = tokio::time::timeout(WAIT, sub.err()).await.unwrap();
    assert!(err.is_none());

    tokio::time::timeout(WAIT, sub.unsubscribe()).await.unwrap();
    assert!(sub.err().await.is_none());

    let err = client.call::<String>("eth_blockNumber", vec![]).await.unwrap_err();
    assert!(matches!(err, TransportError::Closed));
}

#[tokio::test]
async fn dropped_connection_fails_subscription_and_client_reconnects() {
    let (url, _live) = spawn_node().await;
    let client = WsRpcClient::connect(&url, config()).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<BlockHeader>(8);
    let sub = client.subscribe("eth", "newHeads", vec![], tx).await.unwrap();
    for n in 1..=3 {
        assert_eq!(recv(&mut rx).await.number, n);
    }

    assert!(client.request("test_disconnect", vec![]).await.is_err());
    let err = tokio::time::timeout(WAIT, sub.err()).await.unwrap();
    assert!(matches!(
        err,
        Some(SubscriptionError::Transport(TransportError::WebSocket(_)))
    ));

    // requests queue up until the connection is re-established
    let block = tokio::time::timeout(WAIT, client.call::<String>("eth_blockNumber", vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(block, "0x10");

    sub.unsubscribe().await;
    assert!(sub.err().await.is_none());
}
