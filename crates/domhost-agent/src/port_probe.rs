use std::{io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use crate::config::AgentConfig;

/// Answers whether any process on this host still holds a port.
pub trait PortProbe: Send + Sync {
    fn is_port_free(&self, port: u16) -> BoxFuture<'_, bool>;
}

/// Binds the port and closes it right away.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

async fn try_bind(port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    drop(listener);
    Ok(())
}

impl PortProbe for TcpPortProbe {
    fn is_port_free(&self, port: u16) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, try_bind(port)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) if e.kind() == ErrorKind::AddrInUse => false,
                Ok(Err(e)) => {
                    tracing::warn!(port, error = %e, "port probe failed; treating port as in use");
                    false
                }
                Err(_) => {
                    tracing::warn!(port, timeout_ms = self.timeout.as_millis() as u64, "port probe timed out");
                    false
                }
            }
        })
    }
}

/// Delegates the check to an external script (`<script> <port>`, exit 0 = free).
///
/// Used where game processes run under another OS user and a plain bind
/// cannot see their sockets.
#[derive(Debug, Clone)]
pub struct ScriptPortProbe {
    script: PathBuf,
    timeout: Duration,
}

impl ScriptPortProbe {
    pub fn new(script: PathBuf, timeout: Duration) -> Self {
        Self { script, timeout }
    }
}

impl PortProbe for ScriptPortProbe {
    fn is_port_free(&self, port: u16) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(&self.script);
            cmd.arg(port.to_string())
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true);

            match tokio::time::timeout(self.timeout, cmd.status()).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(e)) => {
                    tracing::warn!(port, script = %self.script.display(), error = %e, "port probe script failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(port, script = %self.script.display(), "port probe script timed out");
                    false
                }
            }
        })
    }
}

pub fn from_config(cfg: &AgentConfig) -> Arc<dyn PortProbe> {
    match &cfg.port_probe_script {
        Some(script) => Arc::new(ScriptPortProbe::new(script.clone(), cfg.port_probe_timeout())),
        None => Arc::new(TcpPortProbe::new(cfg.port_probe_timeout())),
    }
}
