use std::path::{Path, PathBuf};

use domhost_process::{GameKey, GameType};

use crate::config::AgentConfig;

pub const STATUS_DUMP_FILE: &str = "statusdump.txt";
/// Copy of the status dump taken by the pre-exec hook, before a turn rolls.
pub const STALES_DUMP_FILE: &str = "stales_statusdump.txt";
/// Created by the game once it leaves the lobby.
pub const STARTED_MARKER_FILE: &str = "ftherlnd";
pub const COMMAND_FILE: &str = "domcmd";

/// On-disk layout of hosted games, derived from the agent config.
#[derive(Debug, Clone)]
pub struct GamePaths {
    savedgames: Vec<(GameType, PathBuf)>,
    logs_dir: PathBuf,
    backups_dir: PathBuf,
}

impl GamePaths {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        let savedgames = GameType::ALL
            .into_iter()
            .filter_map(|t| cfg.install(t).ok().map(|i| (t, i.savedgames.clone())))
            .collect();
        Self {
            savedgames,
            logs_dir: cfg.logs_dir(),
            backups_dir: cfg.backups_dir(),
        }
    }

    pub fn savedgames_root(&self, game_type: GameType) -> Option<&Path> {
        self.savedgames
            .iter()
            .find(|(t, _)| *t == game_type)
            .map(|(_, p)| p.as_path())
    }

    pub fn configured_types(&self) -> impl Iterator<Item = GameType> + '_ {
        self.savedgames.iter().map(|(t, _)| *t)
    }

    pub fn game_dir(&self, key: &GameKey) -> anyhow::Result<PathBuf> {
        let name = validate_game_name(&key.name)?;
        let root = self
            .savedgames_root(key.game_type)
            .ok_or_else(|| anyhow::anyhow!("game type not configured: {}", key.game_type))?;
        Ok(root.join(name))
    }

    pub fn status_dump(&self, key: &GameKey) -> anyhow::Result<PathBuf> {
        Ok(self.game_dir(key)?.join(STATUS_DUMP_FILE))
    }

    pub fn stales_dump(&self, key: &GameKey) -> anyhow::Result<PathBuf> {
        Ok(self.game_dir(key)?.join(STALES_DUMP_FILE))
    }

    pub fn started_marker(&self, key: &GameKey) -> anyhow::Result<PathBuf> {
        Ok(self.game_dir(key)?.join(STARTED_MARKER_FILE))
    }

    pub fn command_file(&self, key: &GameKey) -> anyhow::Result<PathBuf> {
        Ok(self.game_dir(key)?.join(COMMAND_FILE))
    }

    pub fn game_logs_dir(&self, key: &GameKey) -> PathBuf {
        self.logs_dir
            .join(key.game_type.as_str())
            .join(sanitize_for_path(&key.name))
    }

    pub fn turn_backup_dir(&self, key: &GameKey, turn: u32) -> anyhow::Result<PathBuf> {
        let name = validate_game_name(&key.name)?;
        Ok(self
            .backups_dir
            .join(key.game_type.as_str())
            .join(name)
            .join(format!("turn-{turn}")))
    }

    /// Maps live in a `maps` directory beside the saved-games root.
    pub fn map_file(&self, game_type: GameType, file_name: &str) -> anyhow::Result<PathBuf> {
        let root = self
            .savedgames_root(game_type)
            .ok_or_else(|| anyhow::anyhow!("game type not configured: {game_type}"))?;
        let plain = Path::new(file_name)
            .file_name()
            .is_some_and(|f| f == file_name);
        if !plain || !file_name.ends_with(".map") {
            anyhow::bail!("invalid map file name: {file_name}");
        }
        let base = root.parent().unwrap_or(root);
        Ok(base.join("maps").join(file_name))
    }

    /// Lists the names of games that have a saved-games directory.
    pub async fn list_saved_games(&self, game_type: GameType) -> anyhow::Result<Vec<String>> {
        let Some(root) = self.savedgames_root(game_type) else {
            return Ok(Vec::new());
        };
        let mut rd = match tokio::fs::read_dir(root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read savedgames root {}", root.display())));
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // The game keeps its own scratch directory next to real games.
            if name.eq_ignore_ascii_case("newlords") || validate_game_name(&name).is_err() {
                continue;
            }
            out.push(name);
        }
        out.sort();
        Ok(out)
    }
}

/// Game names double as directory names and registry keys, so they are
/// taken verbatim: surrounding whitespace is rejected, not trimmed.
pub fn validate_game_name(name: &str) -> anyhow::Result<&str> {
    if name.is_empty() {
        anyhow::bail!("game name must be non-empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        anyhow::bail!("invalid game name: {name}");
    }
    Ok(name)
}

fn sanitize_for_path(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameInstallConfig;

    fn paths(root: &Path) -> GamePaths {
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
        GamePaths::from_config(&cfg)
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(validate_game_name("").is_err());
        assert!(validate_game_name("../etc").is_err());
        assert!(validate_game_name("a b").is_err());
        assert!(validate_game_name(" Kingdoms_2").is_err());
        assert!(validate_game_name("Kingdoms_2\n").is_err());
        assert_eq!(validate_game_name("Kingdoms_2").unwrap(), "Kingdoms_2");
    }

    #[test]
    fn resolves_game_files() {
        let p = paths(Path::new("/srv"));
        let key = GameKey::new("Kingdoms", GameType::Dom5);
        assert_eq!(
            p.status_dump(&key).unwrap(),
            PathBuf::from("/srv/savedgames/Kingdoms/statusdump.txt")
        );
        assert_eq!(
            p.turn_backup_dir(&key, 4).unwrap(),
            PathBuf::from("/srv/backups/dom5/Kingdoms/turn-4")
        );
        assert!(p.game_dir(&GameKey::new("Kingdoms", GameType::Dom6)).is_err());
        assert_eq!(
            p.map_file(GameType::Dom5, "silent.map").unwrap(),
            PathBuf::from("/srv/maps/silent.map")
        );
        assert!(p.map_file(GameType::Dom5, "../silent.map").is_err());
        assert!(p.map_file(GameType::Dom5, "silent.tga").is_err());
    }

    #[tokio::test]
    async fn lists_game_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let root = dir.path().join("savedgames");
        std::fs::create_dir_all(root.join("Beta")).unwrap();
        std::fs::create_dir_all(root.join("Alpha")).unwrap();
        std::fs::create_dir_all(root.join("newlords")).unwrap();
        std::fs::write(root.join("stray.txt"), b"x").unwrap();

        let games = p.list_saved_games(GameType::Dom5).await.unwrap();
        assert_eq!(games, vec!["Alpha".to_string(), "Beta".to_string()]);
        assert!(p.list_saved_games(GameType::Dom6).await.unwrap().is_empty());
    }
}
