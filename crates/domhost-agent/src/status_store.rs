use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use anyhow::Context;
use domhost_process::{GameKey, GameUpdate, Nation, Outbound, StatusDump};
use tokio::sync::Mutex;

use crate::{counter::Counter, events::Reporter, game::Game, paths::GamePaths};

#[derive(Debug, Default)]
struct GameStatus {
    game: Option<Arc<Game>>,
    snapshot: Option<StatusDump>,
    modified: Option<SystemTime>,
    counter: Counter,
    // The dump vanished; the next one starts a new hosting cycle.
    detached: bool,
}

impl GameStatus {
    fn is_online(&self) -> bool {
        self.game.as_ref().is_some_and(|g| g.is_online())
    }

    fn detach_snapshot(&mut self) -> bool {
        if self.snapshot.is_none() {
            return false;
        }
        self.snapshot = None;
        self.modified = None;
        self.detached = true;
        true
    }

    fn install_snapshot(&mut self, dump: StatusDump, modified: Option<SystemTime>) {
        if self.detached {
            self.counter = Counter::new();
            if self.is_online() {
                self.counter.start();
            }
            self.detached = false;
        }
        self.snapshot = Some(dump);
        self.modified = match (self.modified, modified) {
            (Some(known), Some(new)) => Some(known.max(new)),
            (known, new) => new.or(known),
        };
    }
}

/// Latest turn status and online time of every known game.
#[derive(Clone)]
pub struct StatusStore {
    inner: Arc<Mutex<HashMap<GameKey, GameStatus>>>,
    paths: GamePaths,
    reporter: Arc<dyn Reporter>,
    interval: Duration,
    cycle_running: Arc<AtomicBool>,
    parses: Arc<AtomicU64>,
}

impl StatusStore {
    pub fn new(paths: GamePaths, reporter: Arc<dyn Reporter>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            paths,
            reporter,
            interval,
            cycle_running: Arc::new(AtomicBool::new(false)),
            parses: Arc::new(AtomicU64::new(0)),
        }
    }

    #[cfg(test)]
    pub fn parse_count(&self) -> u64 {
        self.parses.load(Ordering::Relaxed)
    }

    pub async fn keys(&self) -> Vec<GameKey> {
        let mut keys: Vec<_> = self.inner.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn snapshot(&self, key: &GameKey) -> Option<StatusDump> {
        self.inner
            .lock()
            .await
            .get(key)
            .and_then(|s| s.snapshot.clone())
    }

    async fn track_saved_games(&self) -> anyhow::Result<Vec<GameKey>> {
        let mut found = Vec::new();
        for game_type in self.paths.configured_types().collect::<Vec<_>>() {
            for name in self.paths.list_saved_games(game_type).await? {
                found.push(GameKey::new(name, game_type));
            }
        }
        let mut inner = self.inner.lock().await;
        for key in &found {
            inner.entry(key.clone()).or_default();
        }
        Ok(found)
    }

    /// Seeds a status for every game with saved state on disk.
    pub async fn populate(&self) -> anyhow::Result<usize> {
        let keys = self.track_saved_games().await?;
        for key in &keys {
            if let Err(e) = self.refresh(key, false).await {
                tracing::warn!(game = %key, error = %format!("{e:#}"), "failed to load status");
            }
        }
        tracing::info!(games = keys.len(), "status store populated");
        Ok(keys.len())
    }

    /// Links a hosted game to its status and reports it.
    pub async fn attach_game(&self, game: Arc<Game>) {
        let key = game.key().clone();
        {
            let mut inner = self.inner.lock().await;
            let status = inner.entry(key.clone()).or_default();
            if game.is_online() {
                status.counter.start();
            } else {
                status.counter.stop();
            }
            status.game = Some(game);
        }
        self.update(&key).await;
    }

    pub async fn detach_game(&self, key: &GameKey) {
        self.inner.lock().await.remove(key);
    }

    /// Starts or stops the online counter, then refreshes and reports.
    pub async fn set_online(&self, key: &GameKey, online: bool) {
        if let Some(status) = self.inner.lock().await.get_mut(key) {
            let was_online = status.counter.is_started();
            if online {
                status.counter.start();
            } else {
                status.counter.stop();
            }
            if was_online && !online {
                tracing::debug!(game = %key, online_total_ms = status.counter.total().as_millis() as u64, "online counter stopped");
            }
        }
        self.update(key).await;
    }

    /// Spawns the recurring poll. Returns false if it is already running.
    pub fn start_update_cycle(&self) -> bool {
        if self.cycle_running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = store.run_cycle().await {
                    tracing::warn!(error = %format!("{e:#}"), "status cycle failed");
                }
                tokio::time::sleep(store.interval).await;
            }
        });
        true
    }

    /// Refreshes and reports every tracked game. Per-game failures are logged.
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        self.track_saved_games().await?;
        let keys = self.keys().await;
        let updates = keys.iter().map(|key| async move {
            let res = self.refresh(key, false).await;
            self.report(key).await;
            (key, res)
        });
        for (key, res) in futures_util::future::join_all(updates).await {
            if let Err(e) = res {
                tracing::warn!(game = %key, error = %format!("{e:#}"), "status update failed");
            }
        }
        Ok(())
    }

    /// Refreshes if the dump changed, then reports. Failures are logged.
    pub async fn update(&self, key: &GameKey) {
        if let Err(e) = self.refresh(key, false).await {
            tracing::warn!(game = %key, error = %format!("{e:#}"), "status update failed");
        }
        self.report(key).await;
    }

    /// Re-reads the dump even if its modification time did not change.
    pub async fn force_update(&self, key: &GameKey) -> anyhow::Result<()> {
        self.inner.lock().await.entry(key.clone()).or_default();
        let res = self.refresh(key, true).await;
        self.report(key).await;
        res.map(|_| ())
    }

    /// Returns whether a new snapshot was stored. A missing dump is not an
    /// error; it detaches whatever snapshot was held.
    async fn refresh(&self, key: &GameKey, force: bool) -> anyhow::Result<bool> {
        let path = self.paths.status_dump(key)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut inner = self.inner.lock().await;
                if inner.get_mut(key).is_some_and(GameStatus::detach_snapshot) {
                    tracing::info!(game = %key, "status dump gone; snapshot detached");
                }
                return Ok(false);
            }
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };
        let modified = meta.modified().ok();

        if !force {
            let inner = self.inner.lock().await;
            let known = inner.get(key).and_then(|s| s.modified);
            if matches!((known, modified), (Some(known), Some(modified)) if modified <= known) {
                return Ok(false);
            }
        }

        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        self.parses.fetch_add(1, Ordering::Relaxed);
        let dump = StatusDump::parse(&String::from_utf8_lossy(&raw))
            .with_context(|| format!("parse {}", path.display()))?;

        let mut inner = self.inner.lock().await;
        let status = inner.entry(key.clone()).or_default();
        // Another refresh may have stored a newer dump while this one was parsing.
        if !force
            && matches!((status.modified, modified), (Some(known), Some(modified)) if modified <= known)
        {
            return Ok(false);
        }
        status.install_snapshot(dump, modified);
        Ok(true)
    }

    async fn report(&self, key: &GameKey) {
        let update = {
            let mut inner = self.inner.lock().await;
            let Some(status) = inner.get_mut(key) else {
                return;
            };
            GameUpdate {
                game_name: key.name.clone(),
                game_type: key.game_type,
                is_online: status.is_online(),
                uptime: status.counter.uptime().as_millis() as u64,
                status_dump: status.snapshot.clone(),
            }
        };
        self.reporter.emit(Outbound::GameUpdate(update));
    }

    async fn current(&self, key: &GameKey) -> anyhow::Result<StatusDump> {
        if let Err(e) = self.refresh(key, false).await {
            tracing::warn!(game = %key, error = %format!("{e:#}"), "using previous status");
        }
        self.snapshot(key)
            .await
            .ok_or_else(|| anyhow::anyhow!("no status available for {key}"))
    }

    /// Nations whose pretender/order file is present in the game directory.
    pub async fn submitted_pretenders(&self, key: &GameKey) -> anyhow::Result<Vec<Nation>> {
        let dump = self.current(key).await?;
        let dir = self.paths.game_dir(key)?;
        let mut out = Vec::new();
        for nation in dump.nations {
            if tokio::fs::try_exists(dir.join(nation.order_file_name()))
                .await
                .unwrap_or(false)
            {
                out.push(nation);
            }
        }
        Ok(out)
    }

    pub async fn undone_turns(&self, key: &GameKey) -> anyhow::Result<Vec<Nation>> {
        let dump = self.current(key).await?;
        Ok(dump.undone_turns().into_iter().cloned().collect())
    }

    pub async fn unchecked_turns(&self, key: &GameKey) -> anyhow::Result<Vec<Nation>> {
        let dump = self.current(key).await?;
        Ok(dump.unchecked_turns().into_iter().cloned().collect())
    }

    /// Reads the pre-turn copy of the dump, returns the nations that never
    /// opened their turn, and deletes the copy.
    pub async fn fetch_stales(&self, key: &GameKey) -> anyhow::Result<Vec<Nation>> {
        let path = self.paths.stales_dump(key)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let dump = StatusDump::parse(&String::from_utf8_lossy(&raw))
            .with_context(|| format!("parse {}", path.display()))?;
        let stales = dump.unchecked_turns().into_iter().cloned().collect();

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(game = %key, path = %path.display(), error = %e, "failed to delete stales dump");
        }
        Ok(stales)
    }

    /// Deletes a nation's submitted pretender. Returns false if none was submitted.
    pub async fn remove_pretender(&self, key: &GameKey, nation: &str) -> anyhow::Result<bool> {
        if nation.is_empty()
            || !nation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("invalid nation identifier: {nation:?}");
        }
        let path = self.paths.game_dir(key)?.join(format!("{nation}.2h"));
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
        };
        if removed {
            tracing::info!(game = %key, nation, "pretender removed");
        }
        self.force_update(key).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use domhost_process::GameType;

    use super::*;
    use crate::{
        config::{AgentConfig, GameInstallConfig},
        events::ChannelReporter,
    };

    const DUMP: &str = "Status for 'Kingdoms'\n\
        turn 5, era 2, mods 0, turnlimit 50\n\
        Nation\t5\t56\t1\t5\t2\tearly_ulm\tUlm\tEnigma of Steel\n\
        Nation\t7\t12\t1\t5\t0\tearly_sauromatia\tSauromatia\tAmazon Queens\n\
        Nation\t8\t13\t0\t3\t0\tearly_tien_chi\tT'ien Ch'i\tSpring and Autumn\n";

    fn setup(
        root: &Path,
    ) -> (
        StatusStore,
        tokio::sync::mpsc::UnboundedReceiver<Outbound>,
        std::path::PathBuf,
    ) {
        let mut cfg = AgentConfig {
            data_root: root.to_path_buf(),
            ..AgentConfig::default()
        };
        cfg.games.insert(
            "dom5".to_string(),
            GameInstallConfig {
                executable: root.join("dom5"),
                savedgames: root.join("savedgames"),
            },
        );
        let game_dir = root.join("savedgames/Kingdoms");
        std::fs::create_dir_all(&game_dir).unwrap();
        let (reporter, rx) = ChannelReporter::new();
        let store = StatusStore::new(
            GamePaths::from_config(&cfg),
            Arc::new(reporter),
            Duration::from_secs(30),
        );
        (store, rx, game_dir)
    }

    fn key() -> GameKey {
        GameKey::new("Kingdoms", GameType::Dom5)
    }

    fn updates(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Vec<GameUpdate> {
        let mut out = Vec::new();
        while let Ok(Outbound::GameUpdate(u)) = rx.try_recv() {
            out.push(u);
        }
        out
    }

    #[tokio::test]
    async fn unchanged_dump_is_not_reparsed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx, game_dir) = setup(dir.path());
        let path = game_dir.join("statusdump.txt");
        std::fs::write(&path, DUMP).unwrap();

        assert_eq!(store.populate().await.unwrap(), 1);
        let first = store.snapshot(&key()).await.unwrap();
        store.update(&key()).await;
        assert_eq!(store.parse_count(), 1);
        assert_eq!(store.snapshot(&key()).await.unwrap(), first);

        store.force_update(&key()).await.unwrap();
        assert_eq!(store.parse_count(), 2);

        let later = SystemTime::now() + Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();
        store.update(&key()).await;
        assert_eq!(store.parse_count(), 3);
    }

    #[tokio::test]
    async fn missing_dump_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx, _) = setup(dir.path());

        store.force_update(&key()).await.unwrap();
        assert_eq!(store.parse_count(), 0);
        let u = updates(&mut rx);
        assert_eq!(u.len(), 1);
        assert!(u[0].status_dump.is_none());
        assert!(!u[0].is_online);
    }

    #[tokio::test]
    async fn queries_follow_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx, game_dir) = setup(dir.path());
        std::fs::write(game_dir.join("statusdump.txt"), DUMP).unwrap();
        std::fs::write(game_dir.join("early_ulm.2h"), b"orders").unwrap();

        let undone: Vec<_> = store
            .undone_turns(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.short_name)
            .collect();
        assert_eq!(undone, vec!["Sauromatia".to_string()]);

        let submitted = store.submitted_pretenders(&key()).await.unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].file_identifier, "early_ulm");

        assert!(store.remove_pretender(&key(), "early_ulm").await.unwrap());
        assert!(!game_dir.join("early_ulm.2h").exists());
        assert!(store.submitted_pretenders(&key()).await.unwrap().is_empty());
        assert!(!store.remove_pretender(&key(), "early_ulm").await.unwrap());
        assert!(store.remove_pretender(&key(), "../x").await.is_err());
    }

    #[tokio::test]
    async fn fetch_stales_consumes_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx, game_dir) = setup(dir.path());
        let stales = game_dir.join("stales_statusdump.txt");
        std::fs::write(&stales, DUMP).unwrap();

        let names: Vec<_> = store
            .fetch_stales(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.short_name)
            .collect();
        assert_eq!(names, vec!["Sauromatia".to_string()]);
        assert!(!stales.exists());
        assert!(store.fetch_stales(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_dump_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx, game_dir) = setup(dir.path());
        let path = game_dir.join("statusdump.txt");
        std::fs::write(&path, DUMP).unwrap();
        store.force_update(&key()).await.unwrap();

        std::fs::write(&path, "Status\nno turn here\n").unwrap();
        assert!(store.force_update(&key()).await.is_err());
        assert_eq!(store.snapshot(&key()).await.unwrap().turn, 5);
    }

    #[tokio::test]
    async fn vanished_dump_detaches_and_reappearance_resets_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx, game_dir) = setup(dir.path());
        let path = game_dir.join("statusdump.txt");
        std::fs::write(&path, DUMP).unwrap();
        store.force_update(&key()).await.unwrap();
        store
            .inner
            .lock()
            .await
            .get_mut(&key())
            .unwrap()
            .counter
            .start();
        updates(&mut rx);

        std::fs::remove_file(&path).unwrap();
        store.update(&key()).await;
        let u = updates(&mut rx);
        assert_eq!(u.len(), 1);
        assert!(u[0].status_dump.is_none());
        assert!(store.snapshot(&key()).await.is_none());

        std::fs::write(&path, DUMP.replace("turn 5", "turn 1")).unwrap();
        store.update(&key()).await;
        assert_eq!(store.snapshot(&key()).await.unwrap().turn, 1);
        let inner = store.inner.lock().await;
        let status = inner.get(&key()).unwrap();
        assert!(!status.detached);
        assert!(!status.counter.is_started());
        assert_eq!(status.counter.total(), Duration::ZERO);
    }

    #[tokio::test]
    async fn last_modified_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx, game_dir) = setup(dir.path());
        let path = game_dir.join("statusdump.txt");
        let set_mtime = |t: SystemTime| {
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(t)
                .unwrap();
        };
        let now = SystemTime::now();

        std::fs::write(&path, DUMP).unwrap();
        set_mtime(now + Duration::from_secs(60));
        store.update(&key()).await;
        let known = store.inner.lock().await.get(&key()).unwrap().modified;
        assert!(known.is_some());

        std::fs::write(&path, DUMP.replace("turn 5", "turn 6")).unwrap();
        set_mtime(now);
        store.update(&key()).await;
        assert_eq!(store.snapshot(&key()).await.unwrap().turn, 5);

        store.force_update(&key()).await.unwrap();
        assert_eq!(store.snapshot(&key()).await.unwrap().turn, 6);
        assert_eq!(store.inner.lock().await.get(&key()).unwrap().modified, known);
    }

    #[tokio::test]
    async fn update_cycle_starts_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx, game_dir) = setup(dir.path());
        std::fs::write(game_dir.join("statusdump.txt"), DUMP).unwrap();

        assert!(store.start_update_cycle());
        assert!(!store.start_update_cycle());

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            Outbound::GameUpdate(u) => {
                assert_eq!(u.game_name, "Kingdoms");
                assert_eq!(u.status_dump.map(|d| d.turn), Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
