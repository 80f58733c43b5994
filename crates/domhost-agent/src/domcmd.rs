use std::path::PathBuf;

use anyhow::Context;
use domhost_process::GameKey;

use crate::paths::GamePaths;

/// Adjustments the running game picks up from its `domcmd` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCommand {
    /// Hours between turns, expressed in minutes. Zero disables the timer.
    pub interval_minutes: Option<u32>,
    pub time_left_seconds: Option<u64>,
    /// Ascension points needed to win.
    pub ap: Option<u32>,
    pub cataclysm_turn: Option<u32>,
}

impl GameCommand {
    pub fn is_empty(&self) -> bool {
        self.interval_minutes.is_none()
            && self.time_left_seconds.is_none()
            && self.ap.is_none()
            && self.cataclysm_turn.is_none()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(v) = self.interval_minutes {
            out.push_str(&format!("setinterval {v}\n"));
        }
        if let Some(v) = self.time_left_seconds {
            out.push_str(&format!("settimeleft {v}\n"));
        }
        if let Some(v) = self.ap {
            out.push_str(&format!("setap {v}\n"));
        }
        if let Some(v) = self.cataclysm_turn {
            out.push_str(&format!("setcataclysm {v}\n"));
        }
        out
    }
}

/// Writes the command file next to the game's saved state.
///
/// The file is written under a temporary name and renamed into place so the
/// game never reads a half-written command set.
pub async fn write_command_file(
    paths: &GamePaths,
    key: &GameKey,
    cmd: &GameCommand,
) -> anyhow::Result<PathBuf> {
    if cmd.is_empty() {
        anyhow::bail!("no commands given for {key}");
    }
    let path = paths.command_file(key)?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, cmd.render())
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    tracing::info!(game = %key, ?cmd, "command file written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use domhost_process::GameType;

    use super::*;
    use crate::config::{AgentConfig, GameInstallConfig};

    #[test]
    fn renders_only_present_fields() {
        let cmd = GameCommand {
            interval_minutes: Some(1440),
            cataclysm_turn: Some(120),
            ..GameCommand::default()
        };
        assert_eq!(cmd.render(), "setinterval 1440\nsetcataclysm 120\n");
        assert!(GameCommand::default().is_empty());
    }

    #[test]
    fn deserializes_camel_case() {
        let cmd: GameCommand =
            serde_json::from_str(r#"{"timeLeftSeconds": 3600, "ap": 8}"#).unwrap();
        assert_eq!(cmd.render(), "settimeleft 3600\nsetap 8\n");
    }

    #[tokio::test]
    async fn writes_into_game_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::default();
        cfg.games.insert(
            "dom6".to_string(),
            GameInstallConfig {
                executable: dir.path().join("dom6"),
                savedgames: dir.path().join("savedgames"),
            },
        );
        let paths = GamePaths::from_config(&cfg);
        let key = GameKey::new("Kingdoms", GameType::Dom6);

        let err = write_command_file(&paths, &key, &GameCommand::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no commands"));

        let cmd = GameCommand {
            ap: Some(10),
            ..GameCommand::default()
        };
        let path = write_command_file(&paths, &key, &cmd).await.unwrap();
        assert_eq!(path, dir.path().join("savedgames/Kingdoms/domcmd"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "setap 10\n");
        assert!(!path.with_extension("tmp").exists());
    }
}
