use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use domhost_process::{GameKey, GameSettings};
use tokio::sync::Mutex;

use crate::{
    events::HostEvent,
    game::{Game, GameEnv, are_same_settings},
    kill::{KillError, KillPolicy, kill_instance},
    paths::validate_game_name,
    port_probe::PortProbe,
    reserved_ports::ReservedPorts,
};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("unknown game: {0}")]
    UnknownGame(GameKey),
    #[error("{game}: port {port} is in use by another process while the game is offline")]
    PortBusy { game: GameKey, port: u16 },
    #[error("port {port} is already bound to {owner}")]
    PortTaken { port: u16, owner: GameKey },
    #[error("no free port left in range")]
    NoFreePort,
    #[error("failed to launch {game}: {message}")]
    Launch { game: GameKey, message: String },
    #[error(transparent)]
    Kill(#[from] KillError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostingOutcome {
    Queued {
        #[serde(rename = "delayMs", serialize_with = "ser_millis")]
        delay: Duration,
    },
    AlreadyQueued,
    AlreadyOnline,
}

fn ser_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PopulateReport {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Default)]
struct Registry {
    by_key: HashMap<GameKey, Arc<Game>>,
    by_port: HashMap<u16, GameKey>,
    // A marker belongs to the entity whose launch is pending, not to its key.
    queued: HashMap<GameKey, Arc<Game>>,
}

impl Registry {
    fn port_owner(&self, port: u16) -> Option<&GameKey> {
        self.by_port.get(&port)
    }

    fn is_queued(&self, game: &Arc<Game>) -> bool {
        self.queued
            .get(game.key())
            .is_some_and(|g| Arc::ptr_eq(g, game))
    }

    fn insert(&mut self, game: Arc<Game>) {
        let key = game.key().clone();
        if let Some(old) = self.by_key.get(&key) {
            let old_port = old.port();
            if self.by_port.get(&old_port) == Some(&key) {
                self.by_port.remove(&old_port);
            }
            if !self.is_queued(&game) {
                self.queued.remove(&key);
            }
        }
        self.by_port.insert(game.port(), key.clone());
        self.by_key.insert(key, game);
    }

    fn remove(&mut self, key: &GameKey) -> Option<Arc<Game>> {
        let game = self.by_key.remove(key)?;
        let port = game.port();
        if self.by_port.get(&port) == Some(key) {
            self.by_port.remove(&port);
        }
        self.queued.remove(key);
        Some(game)
    }

    fn rebind(&mut self, game: &Game, port: u16) {
        let key = game.key();
        let old = game.port();
        if self.by_port.get(&old) == Some(key) {
            self.by_port.remove(&old);
        }
        game.set_port(port);
        self.by_port.insert(port, key.clone());
    }
}

/// Owns every hosted game on this node, indexed by name+type and by port.
///
/// Operations on one game are serialized through that game's op lock; the
/// registry lock itself is never held across a kill or a launch.
#[derive(Clone)]
pub struct HostedGames {
    inner: Arc<Mutex<Registry>>,
    env: Arc<GameEnv>,
    probe: Arc<dyn PortProbe>,
    reserved: ReservedPorts,
    kill_policy: KillPolicy,
    launch_interval: Duration,
}

impl HostedGames {
    pub fn new(env: Arc<GameEnv>, probe: Arc<dyn PortProbe>) -> Self {
        let cfg = &env.config;
        let kill_policy = KillPolicy {
            max_attempts: cfg.kill_max_attempts,
            retry_delay: cfg.kill_retry_delay(),
            via_script: cfg.kill_script.is_some(),
        };
        let reserved = ReservedPorts::new(cfg.port_range.as_range());
        let launch_interval = cfg.launch_interval();
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            env,
            probe,
            reserved,
            kill_policy,
            launch_interval,
        }
    }

    pub fn env(&self) -> &Arc<GameEnv> {
        &self.env
    }

    pub fn reserved(&self) -> &ReservedPorts {
        &self.reserved
    }

    fn notify(&self, ev: HostEvent) {
        let _ = self.env.events.send(ev);
    }

    pub async fn get(&self, key: &GameKey) -> Option<Arc<Game>> {
        self.inner.lock().await.by_key.get(key).cloned()
    }

    pub async fn require(&self, key: &GameKey) -> anyhow::Result<Arc<Game>> {
        self.get(key)
            .await
            .ok_or_else(|| HostError::UnknownGame(key.clone()).into())
    }

    #[cfg(test)]
    pub async fn get_by_port(&self, port: u16) -> Option<Arc<Game>> {
        let reg = self.inner.lock().await;
        reg.port_owner(port).and_then(|k| reg.by_key.get(k)).cloned()
    }

    pub async fn games(&self) -> Vec<Arc<Game>> {
        self.inner.lock().await.by_key.values().cloned().collect()
    }

    pub async fn bound_ports(&self) -> HashSet<u16> {
        self.inner.lock().await.by_port.keys().copied().collect()
    }

    #[cfg(test)]
    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queued.len()
    }

    pub async fn reserve_port(&self) -> Option<u16> {
        let bound = self.bound_ports().await;
        self.reserved.reserve_port(&bound).await
    }

    async fn kill(&self, game: &Game) -> Result<(), HostError> {
        kill_instance(game, self.probe.as_ref(), &self.kill_policy).await?;
        Ok(())
    }

    /// Registers a new game, or returns the existing one for that key.
    async fn resolve_or_create(&self, settings: &GameSettings) -> anyhow::Result<Arc<Game>> {
        validate_game_name(&settings.name)?;
        let key = settings.key();
        let mut reg = self.inner.lock().await;
        if let Some(game) = reg.by_key.get(&key) {
            return Ok(game.clone());
        }
        if let Some(owner) = reg.port_owner(settings.port) {
            return Err(HostError::PortTaken {
                port: settings.port,
                owner: owner.clone(),
            }
            .into());
        }
        let game = Game::new(settings.clone(), self.env.clone());
        reg.insert(game.clone());
        drop(reg);
        tracing::info!(game = %key, port = settings.port, "game registered");
        self.notify(HostEvent::Registered(game.clone()));
        Ok(game)
    }

    /// Brings the registry in line with the coordinator's list of games.
    ///
    /// Games whose arguments changed are killed and replaced by a fresh
    /// entity; a failure on one game never stops the others.
    pub async fn populate(&self, desired: Vec<GameSettings>) -> PopulateReport {
        let mut report = PopulateReport::default();
        for settings in desired {
            let key = settings.key();
            match self.populate_one(settings).await {
                Ok(PopulateStep::Added) => report.added.push(key.to_string()),
                Ok(PopulateStep::Replaced) => report.replaced.push(key.to_string()),
                Ok(PopulateStep::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    tracing::warn!(game = %key, error = %format!("{e:#}"), "populate failed");
                    report.failed.push(format!("{key}: {e:#}"));
                }
            }
        }
        report
    }

    async fn populate_one(&self, settings: GameSettings) -> anyhow::Result<PopulateStep> {
        let Some(existing) = self.get(&settings.key()).await else {
            self.resolve_or_create(&settings).await?;
            return Ok(PopulateStep::Added);
        };

        let _ops = existing.lock_ops().await;
        let current = existing.settings();
        if are_same_settings(&current, &settings) {
            if current.port != settings.port && !existing.is_online() {
                self.rebind_port(&existing, settings.port).await?;
            }
            return Ok(PopulateStep::Unchanged);
        }

        self.kill(&existing).await?;

        let mut reg = self.inner.lock().await;
        if !reg
            .by_key
            .get(existing.key())
            .is_some_and(|g| Arc::ptr_eq(g, &existing))
        {
            anyhow::bail!("{} was removed while being replaced", existing.key());
        }
        match reg.port_owner(settings.port) {
            Some(owner) if owner != existing.key() => {
                return Err(HostError::PortTaken {
                    port: settings.port,
                    owner: owner.clone(),
                }
                .into());
            }
            _ => {}
        }
        let replacement = Game::new(settings, self.env.clone());
        reg.insert(replacement.clone());
        drop(reg);
        tracing::info!(game = %replacement.key(), args = ?replacement.args(), "game settings changed; entity replaced");
        self.notify(HostEvent::Registered(replacement));
        Ok(PopulateStep::Replaced)
    }

    async fn rebind_port(&self, game: &Game, port: u16) -> Result<(), HostError> {
        let mut reg = self.inner.lock().await;
        match reg.port_owner(port) {
            Some(owner) if owner != game.key() => Err(HostError::PortTaken {
                port,
                owner: owner.clone(),
            }),
            _ => {
                reg.rebind(game, port);
                Ok(())
            }
        }
    }

    /// Queues a launch, staggered behind whatever is already queued.
    pub async fn request_hosting(&self, settings: &GameSettings) -> anyhow::Result<HostingOutcome> {
        let game = self.resolve_or_create(settings).await?;
        let key = game.key().clone();

        if game.is_online() {
            return Ok(HostingOutcome::AlreadyOnline);
        }
        if self.inner.lock().await.is_queued(&game) {
            return Ok(HostingOutcome::AlreadyQueued);
        }

        let port = game.port();
        if !self.probe.is_port_free(port).await {
            return Err(HostError::PortBusy { game: key, port }.into());
        }

        let delay = {
            let mut reg = self.inner.lock().await;
            if reg.is_queued(&game) {
                return Ok(HostingOutcome::AlreadyQueued);
            }
            if !reg.by_key.get(&key).is_some_and(|g| Arc::ptr_eq(g, &game)) {
                anyhow::bail!("{key} was replaced while its launch was being queued");
            }
            let delay = self.launch_interval * reg.queued.len() as u32;
            reg.queued.insert(key.clone(), game.clone());
            delay
        };

        tracing::info!(game = %key, port, delay_ms = delay.as_millis() as u64, "launch queued");
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.run_queued_launch(game).await;
        });
        Ok(HostingOutcome::Queued { delay })
    }

    async fn run_queued_launch(&self, game: Arc<Game>) {
        let key = game.key().clone();
        {
            let mut reg = self.inner.lock().await;
            if reg.is_queued(&game) {
                reg.queued.remove(&key);
            }
            if !reg.by_key.get(&key).is_some_and(|g| Arc::ptr_eq(g, &game)) {
                tracing::info!(game = %key, "queued launch dropped; game was removed or replaced");
                return;
            }
        }

        let _ops = game.lock_ops().await;
        if game.is_online() {
            return;
        }
        match game.launch().await {
            Ok(()) => {
                self.reserved.release_port(game.port()).await;
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::warn!(game = %key, error = %message, "launch failed");
                self.notify(HostEvent::Error { key, message });
            }
        }
    }

    /// Moves an offline-to-be game to a fresh port from the reserved range.
    pub async fn reset_port(&self, key: &GameKey) -> anyhow::Result<u16> {
        let game = self.require(key).await?;
        let _ops = game.lock_ops().await;

        let new_port = self.reserve_port().await.ok_or(HostError::NoFreePort)?;
        if let Err(e) = self.kill(&game).await {
            self.reserved.release_port(new_port).await;
            return Err(e.into());
        }

        let old_port = game.port();
        self.inner.lock().await.rebind(&game, new_port);
        self.reserved.release_port(new_port).await;
        tracing::info!(game = %key, old_port, new_port, "port reset");
        Ok(new_port)
    }

    pub async fn kill_game(&self, key: &GameKey) -> anyhow::Result<()> {
        let game = self.require(key).await?;
        let _ops = game.lock_ops().await;
        self.kill(&game).await?;
        Ok(())
    }

    pub async fn restart_game(&self, key: &GameKey) -> anyhow::Result<HostingOutcome> {
        self.kill_game(key).await?;
        let game = self.require(key).await?;
        self.request_hosting(&game.settings()).await
    }

    /// Restores a backed-up turn and relaunches straight away.
    pub async fn rollback(&self, key: &GameKey, turn: u32) -> anyhow::Result<()> {
        let game = self.require(key).await?;
        let _ops = game.lock_ops().await;

        let backup = self.env.paths.turn_backup_dir(key, turn)?;
        if !tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            anyhow::bail!("no backup for {key} turn {turn} at {}", backup.display());
        }
        self.kill(&game).await?;

        let dest = self.env.paths.game_dir(key)?;
        let copied = restore_backup(&backup, &dest).await?;
        tracing::info!(game = %key, turn, files = copied, "turn restored from backup");

        game.launch_with_rolled_back_turn()
            .await
            .map_err(|e| {
                HostError::Launch {
                    game: key.clone(),
                    message: format!("{e:#}"),
                }
                .into()
            })
    }

    /// Kills every online game. Individual failures are logged and counted.
    pub async fn kill_all_games(&self) -> usize {
        let games = self.games().await;
        let kills = games.into_iter().filter(|g| g.is_online()).map(|game| {
            let store = self.clone();
            async move {
                let _ops = game.lock_ops().await;
                (game.key().clone(), store.kill(&game).await)
            }
        });
        let mut failed = 0;
        for (key, res) in futures_util::future::join_all(kills).await {
            if let Err(e) = res {
                failed += 1;
                tracing::error!(game = %key, error = %e, "failed to kill game");
            }
        }
        failed
    }

    pub async fn delete_game(&self, key: &GameKey) -> anyhow::Result<()> {
        let game = self.require(key).await?;
        let _ops = game.lock_ops().await;
        self.kill(&game).await?;

        let removed = self.inner.lock().await.remove(key);
        if let Some(game) = removed {
            self.reserved.release_port(game.port()).await;
        }
        tracing::info!(game = %key, "game deleted");
        self.notify(HostEvent::Removed(key.clone()));
        Ok(())
    }

    /// Deletes the game, if registered, and its saved-games directory.
    pub async fn delete_game_data(&self, key: &GameKey) -> anyhow::Result<()> {
        let dir = self.env.paths.game_dir(key)?;
        match self.delete_game(key).await {
            Ok(()) => {}
            // Saved data can outlive the registry, e.g. across an agent restart.
            Err(e) if matches!(e.downcast_ref::<HostError>(), Some(HostError::UnknownGame(_))) => {
                tracing::info!(game = %key, "game not registered; removing its data only");
            }
            Err(e) => return Err(e),
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }

    /// Replaces the launch arguments. Returns true if the started marker had
    /// to be deleted so the new settings apply on the next launch.
    pub async fn overwrite_settings(&self, settings: &GameSettings) -> anyhow::Result<bool> {
        let key = settings.key();
        let game = self.require(&key).await?;
        let _ops = game.lock_ops().await;

        game.set_args(settings.args.clone());
        if settings.port != game.port() && !game.is_online() {
            self.rebind_port(&game, settings.port).await?;
        }

        let marker = self.env.paths.started_marker(&key)?;
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => {
                tracing::info!(game = %key, "started marker removed after settings change");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove {}", marker.display())),
        }
    }

    pub async fn has_started(&self, key: &GameKey) -> anyhow::Result<bool> {
        let marker = self.env.paths.started_marker(key)?;
        Ok(tokio::fs::try_exists(&marker).await.unwrap_or(false))
    }
}

enum PopulateStep {
    Added,
    Replaced,
    Unchanged,
}

/// Copies the regular files of `src` into `dest`, overwriting same-named files.
async fn restore_backup(src: &Path, dest: &Path) -> anyhow::Result<usize> {
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut rd = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("read backup {}", src.display()))?;
    let mut copied = 0;
    while let Some(entry) = rd.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let target = dest.join(entry.file_name());
        tokio::fs::copy(entry.path(), &target)
            .await
            .with_context(|| format!("restore {}", target.display()))?;
        copied += 1;
    }
    Ok(copied)
}
