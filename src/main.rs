use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use lavx::node::Node;
use lavx::{Client, ClientEvent, Config, VoiceDirective, VoiceGateway};

/// Stand-in gateway for running without a chat connection: voice
/// directives are only logged.
struct LoggingGateway;

impl VoiceGateway for LoggingGateway {
    fn send(&self, directive: VoiceDirective) {
        info!("🔊 Voice directive: {}", directive.to_payload());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lavx=debug".parse()?)
                .add_directive("tungstenite=info".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Starting lavx v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    let client = Client::new(config, Arc::new(LoggingGateway))
        .await
        .context("Failed to build client")?;
    if client.user_id().is_none() {
        warn!("⚠️ No user id configured (LAVX__USER_ID); nodes will wait for one");
    }

    tokio::spawn(log_events(client.subscribe()));
    client.start()?;

    // A query passed as `--search <query>` is run once the pool is up.
    let args: Vec<String> = std::env::args().collect();
    if let Some(query) = args
        .iter()
        .position(|arg| arg == "--search")
        .and_then(|index| args.get(index + 1))
    {
        search(&client, query).await;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("⚠️ Shutdown signal received");
    client.shutdown();
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Raw { .. }) => {}
            Ok(ClientEvent::NodeError { node, error }) => error!("❌ Node {}: {}", node, error),
            Ok(event) => debug!("📣 {:?}", event),
            Err(RecvError::Lagged(skipped)) => warn!("Event log lagged by {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn search(client: &Client, query: &str) {
    // Give the sockets a moment to reach `ready`.
    for _ in 0..50 {
        if client.nodes().best().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    match client.resolver().resolve(query, None).await {
        Ok(result) => {
            info!("🔍 {:?}: {} tracks", result.kind, result.tracks.len());
            for (index, track) in result.tracks.iter().take(10).enumerate() {
                println!(
                    "{:>2}. {} - {} [{}]",
                    index + 1,
                    track.info.author,
                    track.info.title,
                    track.info.source_name
                );
            }
        }
        Err(e) => error!("❌ Search failed: {}", e),
    }
}

/// Queries every node's info endpoint; fails if any node is unreachable.
async fn health_check(config: &Config) -> Result<()> {
    let mut healthy = true;
    for node_config in &config.nodes {
        let node = Node::connect(node_config.clone())?;
        match node.info().await {
            Ok(info) => println!("{}: OK (Lavalink {})", node.name(), info.version.semver),
            Err(e) => {
                println!("{}: FAILED ({})", node.name(), e);
                healthy = false;
            }
        }
    }

    if healthy {
        Ok(())
    } else {
        anyhow::bail!("One or more nodes are unreachable");
    }
}
