//! Gateward - supervisor entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gateward::{
    capabilities::StorageMount,
    config::GatewayConfig,
    engine::LifecycleEngine,
    host::{CommandMount, LocalFetch, LocalProcessHost, NoopMount},
    server,
    supervisor::GatewaySupervisor,
};

/// Supervise a single long-running gateway process.
#[derive(Debug, Parser)]
#[command(name = "gateward", version, about)]
struct Cli {
    /// Address the supervisor API listens on.
    #[arg(long, env = "GATEWARD_LISTEN", default_value = "127.0.0.1:8200")]
    listen: SocketAddr,

    /// Idempotent command that mounts backing storage before a fresh
    /// gateway start. Without it, storage is assumed to be in place.
    #[arg(long, env = "GATEWARD_MOUNT_COMMAND")]
    mount_command: Option<String>,

    /// Run one ensure pass and exit instead of serving the API.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gateward=info,tower_http=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::resolve()?;
    tracing::info!(
        "Supervising gateway on port {} ({})",
        config.port,
        config.start_command
    );

    let host = Arc::new(LocalProcessHost::new());
    let fetch = Arc::new(LocalFetch::new());
    let storage: Arc<dyn StorageMount> = match &cli.mount_command {
        Some(command) => Arc::new(CommandMount::new(host.clone(), command.clone())),
        None => Arc::new(NoopMount),
    };

    let engine = LifecycleEngine::new(config, host, fetch, storage);
    let supervisor = Arc::new(GatewaySupervisor::new(engine));

    if cli.once {
        let snapshot = supervisor.ensure().await?;
        tracing::info!(
            "Gateway ready (process {})",
            snapshot.process_id.as_deref().unwrap_or("unknown")
        );
        return Ok(());
    }

    server::serve(cli.listen, supervisor).await?;
    Ok(())
}
