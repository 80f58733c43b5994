use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use domhost_process::GameType;

const DEFAULT_CONFIG_PATH: &str = "domhost.toml";

const DEFAULT_STATUS_INTERVAL_MS: u64 = 30_000;
const DEFAULT_LAUNCH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_KILL_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_KILL_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_PORT_PROBE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PORT_RANGE_START: u16 = 6000;
const DEFAULT_PORT_RANGE_END: u16 = 6999;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u16>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Where one game family lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct GameInstallConfig {
    /// Dedicated server executable.
    pub executable: PathBuf,
    /// Directory holding one sub-directory of saved state per game.
    pub savedgames: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn as_range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    /// Keyed by game type name (`dom5`, `dom6`).
    pub games: BTreeMap<String, GameInstallConfig>,
    pub logs_dir: Option<PathBuf>,
    pub backups_dir: Option<PathBuf>,
    /// Command prefix run by the game before and after each turn roll.
    pub turn_hook: Option<String>,
    /// Privileged helper invoked as `<script> <pid> <signal>` instead of native signals.
    pub kill_script: Option<PathBuf>,
    /// External probe invoked as `<script> <port>`; exit code 0 means free.
    pub port_probe_script: Option<PathBuf>,
    pub port_range: PortRange,
    pub status_interval_ms: u64,
    pub launch_interval_ms: u64,
    pub kill_retry_delay_ms: u64,
    pub kill_max_attempts: u32,
    pub port_probe_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            games: BTreeMap::new(),
            logs_dir: None,
            backups_dir: None,
            turn_hook: None,
            kill_script: None,
            port_probe_script: None,
            port_range: PortRange::default(),
            status_interval_ms: DEFAULT_STATUS_INTERVAL_MS,
            launch_interval_ms: DEFAULT_LAUNCH_INTERVAL_MS,
            kill_retry_delay_ms: DEFAULT_KILL_RETRY_DELAY_MS,
            kill_max_attempts: DEFAULT_KILL_MAX_ATTEMPTS,
            port_probe_timeout_ms: DEFAULT_PORT_PROBE_TIMEOUT_MS,
        }
    }
}

impl AgentConfig {
    /// Loads `DOMHOST_CONFIG` (or `domhost.toml`) and applies env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = env_string("DOMHOST_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw).with_context(|| format!("parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("DOMHOST_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = env_string("DOMHOST_LOG_DIR") {
            self.logs_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_u64("DOMHOST_STATUS_INTERVAL_MS") {
            self.status_interval_ms = v.clamp(1_000, 60 * 60 * 1000);
        }
        if let Some(v) = env_u64("DOMHOST_LAUNCH_INTERVAL_MS") {
            self.launch_interval_ms = v.clamp(0, 10 * 60 * 1000);
        }
        if let Some(v) = env_u16("DOMHOST_PORT_RANGE_START") {
            self.port_range.start = v;
        }
        if let Some(v) = env_u16("DOMHOST_PORT_RANGE_END") {
            self.port_range.end = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range.start == 0 || self.port_range.start > self.port_range.end {
            anyhow::bail!(
                "invalid port range: {}..={}",
                self.port_range.start,
                self.port_range.end
            );
        }
        if self.kill_max_attempts == 0 {
            anyhow::bail!("kill_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn install(&self, game_type: GameType) -> anyhow::Result<&GameInstallConfig> {
        self.games
            .get(game_type.as_str())
            .ok_or_else(|| anyhow::anyhow!("game type not configured: {game_type}"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("logs"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.backups_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("backups"))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn launch_interval(&self) -> Duration {
        Duration::from_millis(self.launch_interval_ms)
    }

    pub fn kill_retry_delay(&self) -> Duration {
        Duration::from_millis(self.kill_retry_delay_ms)
    }

    pub fn port_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.port_probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = AgentConfig::from_toml("").unwrap();
        assert_eq!(cfg.port_range, PortRange::default());
        assert_eq!(cfg.kill_max_attempts, 3);
        assert_eq!(cfg.kill_retry_delay(), Duration::from_secs(5));
        assert_eq!(cfg.port_probe_timeout(), Duration::from_secs(30));
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_game_installs() {
        let cfg = AgentConfig::from_toml(
            r#"
data_root = "/srv/domhost"
turn_hook = "/usr/local/bin/domhost-turn"

[games.dom5]
executable = "/opt/dominions5/dom5.sh"
savedgames = "/home/dom/.dominions5/savedgames"

[port_range]
start = 7000
end = 7010
"#,
        )
        .unwrap();
        let dom5 = cfg.install(GameType::Dom5).unwrap();
        assert_eq!(dom5.executable, PathBuf::from("/opt/dominions5/dom5.sh"));
        assert!(cfg.install(GameType::Dom6).is_err());
        assert_eq!(cfg.port_range.as_range(), 7000..=7010);
        assert_eq!(cfg.logs_dir(), PathBuf::from("/srv/domhost/logs"));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let cfg = AgentConfig::from_toml("[port_range]\nstart = 7000\nend = 6000\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid port range"));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::from_file(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.status_interval(), Duration::from_secs(30));
    }
}
