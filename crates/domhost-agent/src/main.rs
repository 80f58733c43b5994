use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod agent;
mod config;
mod counter;
mod domcmd;
mod error_payload;
mod events;
mod game;
mod game_log;
mod hosted_games;
mod kill;
mod map_file;
mod paths;
mod port_probe;
mod process_handle;
mod reserved_ports;
mod rpc;
mod status_store;
mod stdio_transport;

// Stdout carries the coordinator protocol, so console logs go to stderr.
fn init_tracing(cfg: &config::AgentConfig) -> anyhow::Result<WorkerGuard> {
    let dir = cfg.logs_dir();
    std::fs::create_dir_all(&dir)?;
    let (file, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "domhost-agent.log"));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(config::AgentConfig::load()?);
    let _guard = init_tracing(&cfg)?;
    tracing::info!(
        data_root = %cfg.data_root.display(),
        games = ?cfg.games.keys().collect::<Vec<_>>(),
        "domhost-agent starting"
    );

    let (reporter, outbound) = events::ChannelReporter::new();
    let agent = agent::Agent::new(cfg, Arc::new(reporter));
    agent.start().await;

    tokio::select! {
        res = stdio_transport::run(tokio::io::stdin(), tokio::io::stdout(), agent.rpc(), outbound) => {
            if let Err(e) = res {
                tracing::warn!(error = %format!("{e:#}"), "coordinator transport failed");
            }
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("interrupt received");
        }
    }

    agent.shutdown().await;
    Ok(())
}
