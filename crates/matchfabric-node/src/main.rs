//! Matchfabric Node -- matching server node binary.
//!
//! Usage:
//!   matchfabric-node                          # Run with ./matchfabric.toml
//!   matchfabric-node --config path.toml       # Run with custom config
//!   matchfabric-node check-config             # Print resolved settings

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use matchfabric_node::config::{self, ConfigSource, NodeConfig, Tuning};
use matchfabric_node::Coordinator;

#[derive(Parser)]
#[command(name = "matchfabric-node", about = "Matchfabric matching server node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "matchfabric.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print resolved endpoints and tuning values
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "matchfabric_node=info,matchfabric_waiting_room=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let cfg = NodeConfig::load_or_default(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => check_config(&cfg),
        Commands::Run => run(cfg).await,
    }
}

fn check_config(cfg: &NodeConfig) -> anyhow::Result<()> {
    let authority = cfg.resolve(config::AUTHORITY_ENDPOINT)?;
    let peers = cfg.resolve(config::PEER_ENDPOINT)?;
    let tuning = Tuning::resolve(cfg)?;

    println!("authority:        {authority}");
    println!("peer listener:    {} (base port {})", peers.ip(), peers.port());
    println!("max message size: {}", tuning.max_message_size);
    println!("connect attempts: {}", tuning.connect_attempts);
    println!("connect retry:    {:?}", tuning.connect_retry_delay);
    println!("backoff:          {:?}", tuning.reconnect_backoff);
    println!("register timeout: {:?}", tuning.registration_timeout);
    println!("register rounds:  {}", tuning.registration_attempts);
    println!("verify timeout:   {:?}", tuning.verification_timeout);
    Ok(())
}

async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    tracing::info!(
        authority = ?cfg.endpoints.get(config::AUTHORITY_ENDPOINT),
        "starting matchfabric node"
    );

    let node = Coordinator::new(Arc::new(cfg)).start().await?;
    tracing::info!(
        code = node.identity().code,
        listen = %node.listen_addr(),
        "node running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received");
    node.shutdown().await;
    Ok(())
}
