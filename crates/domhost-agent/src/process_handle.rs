use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use domhost_process::{GameKey, LaunchId, StdioStream};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
};

use crate::game_log;

// Upper bound on waiting for pipes to flush after the process exits; a
// grandchild holding the pipe open must not keep the game "online".
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned,
    Stdio(StdioStream, String),
    Exited(Option<i32>),
    /// Fires after `Exited` once every output stream is drained.
    Closed(Option<i32>),
    Error(String),
}

pub type ProcessEventSender = mpsc::UnboundedSender<ProcessEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Terminate,
    Kill,
}

impl KillSignal {
    fn script_arg(self) -> &'static str {
        match self {
            KillSignal::Terminate => "TERM",
            KillSignal::Kill => "KILL",
        }
    }
}

/// How termination signals reach a game process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMethod {
    /// Signal the process group directly.
    Native,
    /// Run `<script> <pid> <TERM|KILL>`, for processes owned by another OS user.
    Script(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: GameKey,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub log_dir: PathBuf,
    pub signal_method: SignalMethod,
}

/// Suppresses blank lines and immediate repeats of the previous line.
#[derive(Debug, Default)]
struct StdioFilter {
    last: Option<String>,
}

impl StdioFilter {
    fn admit(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        if self.last.as_deref() == Some(line) {
            return false;
        }
        self.last = Some(line.to_string());
        true
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn spawn_drain<R>(
    reader: R,
    stream: StdioStream,
    events: ProcessEventSender,
    log_tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut filter = StdioFilter::default();
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Game output is not guaranteed to be UTF-8; never stop draining over it.
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if !filter.admit(line) {
                        continue;
                    }
                    let tag = match stream {
                        StdioStream::Stdout => "stdout",
                        StdioStream::Stderr => "stderr",
                    };
                    let _ = log_tx.send(format!("[{tag}] {line}"));
                    let _ = events.send(ProcessEvent::Stdio(stream, line.to_string()));
                }
                Err(e) => {
                    tracing::debug!(?stream, error = %e, "stdio drain stopped");
                    break;
                }
            }
        }
    })
}

/// One spawned game process.
///
/// Both output pipes are drained for the whole life of the process.
#[derive(Debug)]
pub struct ProcessHandle {
    key: GameKey,
    launch_id: LaunchId,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    drains: Vec<AbortHandle>,
    signal_method: SignalMethod,
}

impl ProcessHandle {
    /// Spawns the process. Errors before the process is running are returned
    /// here rather than sent as events.
    pub async fn spawn(
        spec: LaunchSpec,
        launch_id: LaunchId,
        events: ProcessEventSender,
    ) -> anyhow::Result<Self> {
        let LaunchSpec {
            key,
            executable,
            args,
            log_dir,
            signal_method,
        } = spec;

        if tokio::fs::metadata(&executable).await.is_err() {
            anyhow::bail!(
                "executable for {} not found: {}",
                key.game_type,
                executable.display()
            );
        }

        let mut cmd = Command::new(&executable);
        cmd.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} ({})", key, executable.display()))?;
        let pid = child.id();

        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            tracing::warn!(game = %key, dir = %log_dir.display(), error = %e, "failed to create game log dir");
        }
        let log_tx = game_log::spawn_writer(log_dir);
        let _ = log_tx.send(format!(
            "[domhost-agent] spawned pid={} launch={} args={}",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            launch_id.0,
            args.join(" ")
        ));

        let _ = events.send(ProcessEvent::Spawned);

        let mut drains = Vec::new();
        let mut joins = Vec::new();
        if let Some(out) = child.stdout.take() {
            let h = spawn_drain(out, StdioStream::Stdout, events.clone(), log_tx.clone());
            drains.push(h.abort_handle());
            joins.push(h);
        }
        if let Some(err) = child.stderr.take() {
            let h = spawn_drain(err, StdioStream::Stderr, events.clone(), log_tx.clone());
            drains.push(h.abort_handle());
            joins.push(h);
        }

        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn({
            let alive = alive.clone();
            let key = key.clone();
            async move {
                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        let _ = events.send(ProcessEvent::Error(format!("wait failed: {e}")));
                        None
                    }
                };
                let _ = events.send(ProcessEvent::Exited(code));

                for join in joins {
                    let abort = join.abort_handle();
                    if tokio::time::timeout(DRAIN_GRACE, join).await.is_err() {
                        tracing::warn!(game = %key, "stdio still open after exit; closing it");
                        abort.abort();
                    }
                }

                let _ = log_tx.send(format!("[domhost-agent] process closed: exit_code={code:?}"));
                alive.store(false, Ordering::SeqCst);
                let _ = events.send(ProcessEvent::Closed(code));
            }
        });

        Ok(Self {
            key,
            launch_id,
            pid,
            alive,
            drains,
            signal_method,
        })
    }

    pub fn launch_id(&self) -> &LaunchId {
        &self.launch_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops reading output. Used right before termination.
    pub fn close_stdio(&self) {
        for d in &self.drains {
            d.abort();
        }
    }

    pub fn signaller(&self) -> Signaller {
        Signaller {
            key: self.key.clone(),
            pid: self.pid,
            method: self.signal_method.clone(),
        }
    }
}

/// Detached capability to signal a handle's process.
#[derive(Debug, Clone)]
pub struct Signaller {
    key: GameKey,
    pid: Option<u32>,
    method: SignalMethod,
}

impl Signaller {
    pub async fn send(&self, signal: KillSignal) -> anyhow::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match &self.method {
            SignalMethod::Script(script) => {
                let status = Command::new(script)
                    .arg(pid.to_string())
                    .arg(signal.script_arg())
                    .stdin(std::process::Stdio::null())
                    .status()
                    .await
                    .with_context(|| format!("run kill script {}", script.display()))?;
                if !status.success() {
                    anyhow::bail!(
                        "kill script {} exited with {:?} for {} (pid {pid})",
                        script.display(),
                        status.code(),
                        self.key
                    );
                }
                Ok(())
            }
            SignalMethod::Native => native_signal(pid, signal),
        }
    }
}

#[cfg(unix)]
fn native_signal(pid: u32, signal: KillSignal) -> anyhow::Result<()> {
    let sig = match signal {
        KillSignal::Terminate => libc::SIGTERM,
        KillSignal::Kill => libc::SIGKILL,
    };
    // The child leads its own session, so its pid is also the process group id.
    let rc = unsafe { libc::kill(-(pid as i32), sig) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(anyhow::Error::new(err).context(format!("signal pid {pid}")));
    }
    Ok(())
}

#[cfg(not(unix))]
fn native_signal(pid: u32, _signal: KillSignal) -> anyhow::Result<()> {
    anyhow::bail!("native signals are unsupported on this platform (pid {pid}); configure kill_script")
}
