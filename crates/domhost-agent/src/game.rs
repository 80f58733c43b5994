use std::sync::{Arc, Mutex, MutexGuard, Weak};

use domhost_process::{GameKey, GameSettings, LaunchId};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{
    config::AgentConfig,
    events::{HostEvent, HostEventSender},
    kill::Terminate,
    paths::GamePaths,
    process_handle::{KillSignal, LaunchSpec, ProcessEvent, ProcessHandle, SignalMethod},
};

/// Tells the game the saved state was restored to an earlier turn.
pub const ROLLED_BACK_TURN_FLAG: &str = "--nonewturn";

const FIXED_FLAGS: [&str; 3] = ["--nosteam", "--statusdump", "--textonly"];

#[cfg(windows)]
const PLATFORM_FLAGS: &[&str] = &["--nocrashbox"];
#[cfg(not(windows))]
const PLATFORM_FLAGS: &[&str] = &[];

/// Shared context every hosted game launches with.
#[derive(Debug)]
pub struct GameEnv {
    pub config: Arc<AgentConfig>,
    pub paths: GamePaths,
    pub events: HostEventSender,
}

impl GameEnv {
    pub fn new(config: Arc<AgentConfig>, events: HostEventSender) -> Arc<Self> {
        let paths = GamePaths::from_config(&config);
        Arc::new(Self {
            config,
            paths,
            events,
        })
    }

    fn signal_method(&self) -> SignalMethod {
        match &self.config.kill_script {
            Some(script) => SignalMethod::Script(script.clone()),
            None => SignalMethod::Native,
        }
    }
}

/// Same game name and the same multiset of arguments, in any order.
pub fn are_same_settings(a: &GameSettings, b: &GameSettings) -> bool {
    if a.name != b.name || a.args.len() != b.args.len() {
        return false;
    }
    let mut left: Vec<&str> = a.args.iter().map(String::as_str).collect();
    let mut right: Vec<&str> = b.args.iter().map(String::as_str).collect();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}

fn hook_command(hook: &str, phase: &str, key: &GameKey) -> String {
    format!("{hook} {phase} {} {}", key.name, key.game_type)
}

/// Full command line for one launch: the rollback flag, the coordinator's
/// arguments, then the flags every hosted game needs, then the game name.
pub fn build_launch_args(
    settings: &GameSettings,
    turn_hook: Option<&str>,
    rolled_back: bool,
) -> Vec<String> {
    let key = settings.key();
    let mut out = Vec::with_capacity(settings.args.len() + 12);
    if rolled_back {
        out.push(ROLLED_BACK_TURN_FLAG.to_string());
    }
    out.extend(settings.args.iter().cloned());
    out.push("--port".to_string());
    out.push(settings.port.to_string());
    out.extend(FIXED_FLAGS.iter().map(|f| f.to_string()));
    out.extend(PLATFORM_FLAGS.iter().map(|f| f.to_string()));
    if let Some(hook) = turn_hook {
        out.push("--preexec".to_string());
        out.push(hook_command(hook, "preexec", &key));
        out.push("--postexec".to_string());
        out.push(hook_command(hook, "postexec", &key));
    }
    out.push(key.name);
    out
}

#[derive(Debug)]
struct GameState {
    port: u16,
    args: Vec<String>,
    process: Option<ProcessHandle>,
}

/// A hosted game bound to at most one running process.
#[derive(Debug)]
pub struct Game {
    key: GameKey,
    env: Arc<GameEnv>,
    state: Mutex<GameState>,
    ops: tokio::sync::Mutex<()>,
}

impl Game {
    pub fn new(settings: GameSettings, env: Arc<GameEnv>) -> Arc<Self> {
        Arc::new(Self {
            key: settings.key(),
            env,
            state: Mutex::new(GameState {
                port: settings.port,
                args: settings.args,
                process: None,
            }),
            ops: tokio::sync::Mutex::new(()),
        })
    }

    fn state(&self) -> MutexGuard<'_, GameState> {
        // State updates never panic midway; a poisoned lock still holds valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> &GameKey {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.state().port
    }

    pub fn args(&self) -> Vec<String> {
        self.state().args.clone()
    }

    pub fn settings(&self) -> GameSettings {
        let st = self.state();
        GameSettings {
            name: self.key.name.clone(),
            game_type: self.key.game_type,
            port: st.port,
            args: st.args.clone(),
        }
    }

    /// Takes effect on the next launch.
    pub fn set_port(&self, port: u16) {
        self.state().port = port;
    }

    /// Takes effect on the next launch.
    pub fn set_args(&self, args: Vec<String>) {
        self.state().args = args;
    }

    pub fn is_online(&self) -> bool {
        self.state().process.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().process.as_ref().and_then(|p| p.pid())
    }

    fn is_current_launch(&self, launch_id: &LaunchId) -> bool {
        self.state()
            .process
            .as_ref()
            .is_some_and(|p| p.launch_id() == launch_id)
    }

    /// Serializes launch/kill/reconfigure operations on this game.
    pub async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub fn launch_args(&self, rolled_back: bool) -> Vec<String> {
        build_launch_args(
            &self.settings(),
            self.env.config.turn_hook.as_deref(),
            rolled_back,
        )
    }

    pub async fn launch(self: &Arc<Self>) -> anyhow::Result<()> {
        self.launch_with(false).await
    }

    /// Launches after a rollback restored an earlier turn's files.
    pub async fn launch_with_rolled_back_turn(self: &Arc<Self>) -> anyhow::Result<()> {
        self.launch_with(true).await
    }

    async fn launch_with(self: &Arc<Self>, rolled_back: bool) -> anyhow::Result<()> {
        if self.is_online() {
            anyhow::bail!("{} is already running (pid {:?})", self.key, self.pid());
        }

        let install = self.env.config.install(self.key.game_type)?;
        let spec = LaunchSpec {
            key: self.key.clone(),
            executable: install.executable.clone(),
            args: self.launch_args(rolled_back),
            log_dir: self.env.paths.game_logs_dir(&self.key),
            signal_method: self.env.signal_method(),
        };

        let launch_id = LaunchId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProcessHandle::spawn(spec, launch_id.clone(), tx).await?;
        tracing::info!(game = %self.key, port = self.port(), pid = ?handle.pid(), rolled_back, "game launched");
        self.state().process = Some(handle);

        tokio::spawn(forward_process_events(
            Arc::downgrade(self),
            self.key.clone(),
            launch_id,
            rx,
            self.env.events.clone(),
        ));
        Ok(())
    }
}

async fn forward_process_events(
    game: Weak<Game>,
    key: GameKey,
    launch_id: LaunchId,
    mut rx: mpsc::UnboundedReceiver<ProcessEvent>,
    events: HostEventSender,
) {
    while let Some(ev) = rx.recv().await {
        let current = game
            .upgrade()
            .is_some_and(|g| g.is_current_launch(&launch_id));
        let out = match ev {
            ProcessEvent::Spawned if current => HostEvent::Online(key.clone()),
            ProcessEvent::Exited(code) if current => HostEvent::Exited {
                key: key.clone(),
                code,
            },
            ProcessEvent::Closed(code) if current => {
                tracing::info!(game = %key, exit_code = ?code, "game closed");
                HostEvent::Closed {
                    key: key.clone(),
                    code,
                }
            }
            ProcessEvent::Spawned | ProcessEvent::Exited(_) | ProcessEvent::Closed(_) => {
                tracing::debug!(game = %key, launch = %launch_id.0, "ignoring lifecycle event from a replaced launch");
                continue;
            }
            ProcessEvent::Error(message) => {
                tracing::warn!(game = %key, %message, "game process error");
                HostEvent::Error {
                    key: key.clone(),
                    message,
                }
            }
            ProcessEvent::Stdio(stream, data) => HostEvent::Stdio {
                key: key.clone(),
                stream,
                data,
            },
        };
        if events.send(out).is_err() {
            // Nobody is listening any more; the process handle keeps draining on its own.
            break;
        }
    }
}

impl Terminate for Game {
    fn label(&self) -> String {
        self.key.to_string()
    }

    fn port(&self) -> u16 {
        Game::port(self)
    }

    fn has_live_process(&self) -> bool {
        self.is_online()
    }

    fn close_stdio(&self) {
        if let Some(p) = self.state().process.as_ref() {
            p.close_stdio();
        }
    }

    fn send_signal(&self, signal: KillSignal) -> BoxFuture<'_, anyhow::Result<()>> {
        let signaller = self.state().process.as_ref().map(|p| p.signaller());
        Box::pin(async move {
            match signaller {
                Some(s) => s.send(signal).await,
                None => Ok(()),
            }
        })
    }
}
