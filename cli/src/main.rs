//! chainsub CLI: watch node subscriptions from the terminal.
//!
//! Usage:
//! ```bash
//! # Print new block headers as they arrive (Ctrl-C to unsubscribe)
//! chainsub subscribe --url wss://eth.example.com --kind newHeads
//!
//! # Stop after 10 notifications, with a bounded local queue
//! chainsub subscribe --url ws://localhost:8546 --kind logs --params '[{"address":"0x.."}]' --count 10 --max-queue 256
//!
//! # Send a raw JSON-RPC call over the WebSocket
//! chainsub call --url ws://localhost:8546 --method eth_blockNumber
//!
//! # Mint subscription ids
//! chainsub id --count 3
//! ```

use std::env;
use std::process;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainsub_core::transport::RpcTransport;
use chainsub_pubsub::{SubscriptionConfig, SubscriptionId};
use chainsub_ws::{WsClientConfig, WsRpcClient};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(has_flag(&args, "--log-json"));

    let result = match args[1].as_str() {
        "subscribe" => cmd_subscribe(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "id" => cmd_id(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainsub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainsub {}", env!("CARGO_PKG_VERSION"));
    println!("Watch blockchain node subscriptions\n");
    println!("USAGE:");
    println!("    chainsub <COMMAND>\n");
    println!("COMMANDS:");
    println!("    subscribe  Subscribe and print notifications");
    println!("    call       Send a raw JSON-RPC call over WebSocket");
    println!("    id         Mint random subscription ids");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("SUBSCRIBE FLAGS:");
    println!("    --url <URL>          WebSocket endpoint  [required]");
    println!("    --namespace <NS>     RPC namespace       [default: eth]");
    println!("    --kind <KIND>        Subscription kind   [default: newHeads]");
    println!("    --params <JSON>      Extra params as a JSON array");
    println!("    --count <N>          Exit after N notifications");
    println!("    --max-queue <N>      Local queue bound   [default: 20000]\n");
    println!("GLOBAL FLAGS:");
    println!("    --log-json           Emit logs as JSON (filter with RUST_LOG)");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn cmd_subscribe(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let namespace = parse_flag(args, "--namespace").unwrap_or_else(|| "eth".into());
    let kind = parse_flag(args, "--kind").unwrap_or_else(|| "newHeads".into());
    let params = parse_params(args)?;
    let count = parse_number(args, "--count")?;

    let mut subscription = SubscriptionConfig::default();
    if let Some(max_queue) = parse_number(args, "--max-queue")? {
        subscription.max_queue = max_queue;
    }
    let config = WsClientConfig {
        subscription,
        ..WsClientConfig::default()
    };

    let client = WsRpcClient::connect(&url, config)
        .await
        .map_err(|e| e.to_string())?;
    let (tx, mut rx) = mpsc::channel::<Value>(64);
    let sub = client
        .subscribe(&namespace, &kind, params, tx)
        .await
        .map_err(|e| e.to_string())?;
    if let Some(id) = sub.id() {
        eprintln!("Subscribed to {namespace}/{kind} as {id}");
    }

    let mut received = 0usize;
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    println!("{item}");
                    received += 1;
                    if count.is_some_and(|n| received >= n) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    sub.unsubscribe().await;
    match sub.err().await {
        Some(err) => Err(err.to_string()),
        None => {
            eprintln!("Unsubscribed after {received} notification(s)");
            Ok(())
        }
    }
}

async fn cmd_call(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let method = parse_flag(args, "--method").ok_or("--method is required")?;
    let params = parse_params(args)?;

    let client = WsRpcClient::connect(&url, WsClientConfig::default())
        .await
        .map_err(|e| e.to_string())?;
    let result: Value = client
        .call(&method, params)
        .await
        .map_err(|e| e.to_string())?;

    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    Ok(())
}

fn cmd_id(args: &[String]) -> Result<(), String> {
    let count = parse_number(args, "--count")?.unwrap_or(1);
    for _ in 0..count {
        println!("{}", SubscriptionId::new_random());
    }
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_number(args: &[String], flag: &str) -> Result<Option<usize>, String> {
    parse_flag(args, flag)
        .map(|v| v.parse::<usize>().map_err(|e| format!("{flag}: {e}")))
        .transpose()
}

fn parse_params(args: &[String]) -> Result<Vec<Value>, String> {
    match parse_flag(args, "--params") {
        None => Ok(vec![]),
        Some(raw) => match serde_json::from_str::<Value>(&raw).map_err(|e| format!("--params: {e}"))? {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        },
    }
}
