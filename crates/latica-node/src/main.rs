mod common;
mod events;
mod listen;
mod publish;
mod query;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use latica::{BootstrapPeer, Engine};

#[derive(Parser)]
#[command(name = "latica-node", about = "Run a peer on the Latica relay network")]
struct Cli {
    /// Peer id (64 hex chars). Random, or taken from --state, when absent.
    #[arg(long, global = true)]
    peer_id: Option<String>,

    /// Cluster: 64 hex chars, or any string (hashed with SHA-256).
    #[arg(long, global = true, default_value = "latica")]
    cluster: String,

    /// Main socket port. 0 picks an ephemeral port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Keepalive interval in ms.
    #[arg(long, global = true, default_value = "30000")]
    keepalive: u64,

    /// Extra bootstrap peer `address:port:peerId` (repeatable).
    #[arg(long = "peer", global = true)]
    peers: Vec<BootstrapPeer>,

    /// Only use the --peer list, not the embedded bootstrap peers.
    #[arg(long, global = true)]
    no_default_peers: bool,

    /// Snapshot file restored on start and written on exit.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay for the network and print every engine event as JSONL.
    Run,

    /// Join a subcluster and print the messages published to it.
    Listen {
        /// Shared secret of the subcluster.
        #[arg(long)]
        secret: String,
    },

    /// Publish one message to a subcluster.
    Publish {
        /// Shared secret of the subcluster.
        #[arg(long)]
        secret: String,
        #[arg(long)]
        message: String,
        /// How long to keep relaying after publishing, in ms.
        #[arg(long, default_value = "3000")]
        linger: u64,
    },

    /// Flood a query and print the answers.
    Query {
        #[arg(long)]
        data: String,
        /// How long to wait for answers, in ms.
        #[arg(long, default_value = "5000")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    let snapshot = match &cli.state {
        Some(path) => common::load_state(path)?,
        None => None,
    };
    let peer_id = common::resolve_peer_id(cli.peer_id.as_deref(), snapshot.as_ref())?;
    let cluster_id = common::parse_cluster(&cli.cluster)?;

    let mut config = latica::EngineConfig::new(peer_id)
        .cluster_id(cluster_id)
        .keepalive(Duration::from_millis(cli.keepalive));
    if let Some(port) = cli.port {
        config = config.port(port);
    }
    if cli.no_default_peers {
        config = config.bootstrap(Vec::new());
    }
    for peer in cli.peers {
        config = config.add_bootstrap(peer);
    }
    if let Some(snapshot) = snapshot {
        config = config.restore(snapshot);
    }

    let channels = Engine::bind(config).await?;
    let handle = channels.handle.clone();

    eprintln!("latica-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Peer ID: {peer_id}");
    eprintln!("Cluster: {}", hex::encode(cluster_id));
    eprintln!();

    let result = match cli.command {
        Command::Run => listen::run(channels, None, start).await,
        Command::Listen { secret } => listen::run(channels, Some(secret), start).await,
        Command::Publish {
            secret,
            message,
            linger,
        } => {
            publish::run(
                channels,
                publish::PublishConfig {
                    secret,
                    message,
                    linger: Duration::from_millis(linger),
                },
                start,
            )
            .await
        }
        Command::Query { data, wait } => {
            query::run(channels, &data, Duration::from_millis(wait), start).await
        }
    };

    if let Some(path) = &cli.state {
        if let Err(e) = common::save_state(&handle, path).await {
            eprintln!("failed to save state to {}: {e}", path.display());
        }
    }
    handle.close().await;
    result
}
