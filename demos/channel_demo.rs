use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use interappbus::{
    ChannelActions, ChannelRegistry, ConnectOptions, ConnectionConfig, Identity, LocalRuntime,
    RuntimeConnection, TcpConfig, TcpTransport, TcpTransportListener,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuoteRequest {
    symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    bid: f64,
    ask: f64,
}

const CHANNEL_NAME: &str = "quotes";
const ADDR: &str = "127.0.0.1:9470";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("local");

    match mode {
        "local" => run_local().await?,
        "runtime" => run_runtime().await?,
        "provider" => run_provider().await?,
        "client" => run_client().await?,
        _ => {
            eprintln!("Usage: cargo run --example channel_demo -- [local|runtime|provider|client]");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Everything in one process: runtime, provider and client.
async fn run_local() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = LocalRuntime::new();

    let provider_app = ChannelRegistry::new(runtime.attach(Identity::new("pricer", "main")).await?);
    let client_app = ChannelRegistry::new(runtime.attach(Identity::new("blotter", "main")).await?);

    // The client starts first and waits for the channel to appear
    let pending = {
        let client_app = client_app.clone();
        tokio::spawn(async move { client_app.connect(CHANNEL_NAME, ConnectOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let provider = provider_app.create(CHANNEL_NAME).await?;
    register_quotes(&provider);

    let client = pending.await??;
    println!("[Client] Connected to {:?}", client.provider_identity());

    for symbol in ["ACME", "INITECH"] {
        let quote = client
            .dispatch("quote", serde_json::to_value(QuoteRequest { symbol: symbol.into() })?)
            .await?;
        println!("[Client] {}", quote);
    }

    match client.dispatch("trade", serde_json::Value::Null).await {
        Ok(_) => println!("[Client] unexpected success"),
        Err(e) => println!("[Client] trade failed as expected: {}", e),
    }

    provider.destroy().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("[Client] still connected: {}", client.is_connected());
    Ok(())
}

/// Host the runtime on TCP.
async fn run_runtime() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = LocalRuntime::new();
    let listener = TcpTransportListener::bind(ADDR.parse()?, TcpConfig::default()).await?;
    println!("[Runtime] Listening on {}", listener.local_addr()?);
    runtime.serve_tcp(listener).await?;
    Ok(())
}

async fn run_provider() -> Result<(), Box<dyn std::error::Error>> {
    let registry = attach_tcp("pricer").await?;
    let provider = registry.create(CHANNEL_NAME).await?;
    register_quotes(&provider);
    provider.on_disconnection(|client| println!("[Provider] {} left", client.uuid));
    println!("[Provider] Serving channel {:?}", provider.identity());

    tokio::signal::ctrl_c().await?;
    provider.destroy().await?;
    Ok(())
}

async fn run_client() -> Result<(), Box<dyn std::error::Error>> {
    let registry = attach_tcp("blotter").await?;
    let client = registry.connect(CHANNEL_NAME, ConnectOptions::default()).await?;
    client.on_disconnection(|provider| println!("[Client] {} went away", provider.channel_name));

    let quote = client
        .dispatch("quote", serde_json::to_value(QuoteRequest { symbol: "ACME".into() })?)
        .await?;
    println!("[Client] {}", quote);

    client.disconnect().await?;
    Ok(())
}

async fn attach_tcp(uuid: &str) -> Result<std::sync::Arc<ChannelRegistry>, Box<dyn std::error::Error>> {
    let transport = TcpTransport::connect(ADDR.parse()?, TcpConfig::default()).await?;
    let connection =
        RuntimeConnection::open(transport, Identity::new(uuid, "main"), ConnectionConfig::default()).await?;
    Ok(ChannelRegistry::new(connection))
}

fn register_quotes(provider: &interappbus::ChannelProvider) {
    provider.register_typed("quote", |req: QuoteRequest, sender: Identity| async move {
        println!("[Provider] quote({}) for {}", req.symbol, sender.uuid);
        let mid = req.symbol.len() as f64 * 10.0;
        Ok(Quote {
            symbol: req.symbol,
            bid: mid - 0.05,
            ask: mid + 0.05,
        })
    });
}
