use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::{port_probe::PortProbe, process_handle::KillSignal};

/// What the termination loop needs from a hosted game.
pub trait Terminate: Send + Sync {
    fn label(&self) -> String;
    fn port(&self) -> u16;
    fn has_live_process(&self) -> bool;
    fn close_stdio(&self);
    fn send_signal(&self, signal: KillSignal) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct KillPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Signals go through an external helper, which decides on force itself.
    pub via_script: bool,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            via_script: false,
        }
    }
}

impl KillPolicy {
    fn signal_for(&self, attempt: u32) -> KillSignal {
        if !self.via_script && attempt >= self.max_attempts {
            KillSignal::Kill
        } else {
            KillSignal::Terminate
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KillError {
    #[error(
        "{game}: the process reported dead but port {port} is still in use after {attempts} attempts; try again later"
    )]
    PortStillInUse {
        game: String,
        port: u16,
        attempts: u32,
    },
    #[error(
        "{game}: the process is still alive after {attempts} attempts (port {port} free: {port_free}); try again later"
    )]
    ProcessStillAlive {
        game: String,
        port: u16,
        port_free: bool,
        attempts: u32,
    },
    #[error("{game}: failed to signal process: {message}")]
    Signal { game: String, message: String },
}

/// Terminates a game's process and confirms its port was released.
///
/// Each attempt closes stdio, signals, waits `retry_delay`, then probes the
/// port. Success needs both a free port and no live process.
pub async fn kill_instance(
    target: &dyn Terminate,
    probe: &dyn PortProbe,
    policy: &KillPolicy,
) -> Result<(), KillError> {
    if !target.has_live_process() {
        return Ok(());
    }

    let port = target.port();
    let mut attempt = 1;
    loop {
        target.close_stdio();
        let signal = policy.signal_for(attempt);
        tracing::info!(game = %target.label(), port, attempt, ?signal, "killing game");
        target
            .send_signal(signal)
            .await
            .map_err(|e| KillError::Signal {
                game: target.label(),
                message: format!("{e:#}"),
            })?;

        tokio::time::sleep(policy.retry_delay).await;

        let port_free = probe.is_port_free(port).await;
        let alive = target.has_live_process();
        if port_free && !alive {
            tracing::info!(game = %target.label(), port, attempt, "game killed");
            return Ok(());
        }

        if attempt >= policy.max_attempts {
            return Err(if alive {
                KillError::ProcessStillAlive {
                    game: target.label(),
                    port,
                    port_free,
                    attempts: attempt,
                }
            } else {
                KillError::PortStillInUse {
                    game: target.label(),
                    port,
                    attempts: attempt,
                }
            });
        }

        tracing::warn!(game = %target.label(), port, attempt, port_free, alive, "game not dead yet; retrying");
        attempt += 1;
    }
}
