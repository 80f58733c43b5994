use std::{fmt, str::FromStr};

pub mod status_dump;

pub use status_dump::{Controller, Nation, StatusDump, TurnState};

/// Game family a hosted instance belongs to.
///
/// NOTE: The family only selects the executable and the saved-games root.
/// Hosting, status and termination logic is shared.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Dom5,
    Dom6,
}

impl GameType {
    pub const ALL: [GameType; 2] = [GameType::Dom5, GameType::Dom6];

    pub fn as_str(self) -> &'static str {
        match self {
            GameType::Dom5 => "dom5",
            GameType::Dom6 => "dom6",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown game type: {0}")]
pub struct UnknownGameType(pub String);

impl FromStr for GameType {
    type Err = UnknownGameType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dom5" => Ok(GameType::Dom5),
            "dom6" => Ok(GameType::Dom6),
            _ => Err(UnknownGameType(s.to_string())),
        }
    }
}

/// Identity of a hosted game. Names are unique within a game type.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct GameKey {
    pub name: String,
    #[serde(rename = "type")]
    pub game_type: GameType,
}

impl GameKey {
    pub fn new(name: impl Into<String>, game_type: GameType) -> Self {
        Self {
            name: name.into(),
            game_type,
        }
    }
}

impl fmt::Display for GameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.game_type, self.name)
    }
}

/// Desired hosting state for one game, as sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GameSettings {
    pub name: String,
    #[serde(rename = "type")]
    pub game_type: GameType,
    pub port: u16,
    #[serde(default)]
    pub args: Vec<String>,
}

impl GameSettings {
    pub fn key(&self) -> GameKey {
        GameKey::new(self.name.clone(), self.game_type)
    }
}

/// Identifies one spawn of a game process. A relaunch gets a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LaunchId(pub String);

impl LaunchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioStream {
    Stdout,
    Stderr,
}

/// Per-cycle status report for one game.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdate {
    pub game_name: String,
    #[serde(rename = "type")]
    pub game_type: GameType,
    pub is_online: bool,
    /// Milliseconds online since the previous report for this game.
    pub uptime: u64,
    #[serde(rename = "statusdump")]
    pub status_dump: Option<StatusDump>,
}

/// Fire-and-forget messages from the agent to the coordinator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "trigger", content = "payload")]
pub enum Outbound {
    #[serde(rename = "GAME_UPDATE")]
    GameUpdate(GameUpdate),
    #[serde(rename = "GAME_CLOSED", rename_all = "camelCase")]
    GameClosed {
        game_name: String,
        #[serde(rename = "type")]
        game_type: GameType,
        exit_code: Option<i32>,
    },
    #[serde(rename = "GAME_ERROR", rename_all = "camelCase")]
    GameError {
        game_name: String,
        #[serde(rename = "type")]
        game_type: GameType,
        message: String,
    },
    #[serde(rename = "STDIO_DATA", rename_all = "camelCase")]
    StdioData {
        game_name: String,
        #[serde(rename = "type")]
        game_type: GameType,
        stream: StdioStream,
        data: String,
    },
}

impl Outbound {
    pub fn trigger(&self) -> &'static str {
        match self {
            Outbound::GameUpdate(_) => "GAME_UPDATE",
            Outbound::GameClosed { .. } => "GAME_CLOSED",
            Outbound::GameError { .. } => "GAME_ERROR",
            Outbound::StdioData { .. } => "STDIO_DATA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_id_is_non_empty() {
        let id = LaunchId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, LaunchId::new());
    }

    #[test]
    fn game_type_parses_case_insensitively() {
        assert_eq!("DOM5".parse::<GameType>().unwrap(), GameType::Dom5);
        assert_eq!(" dom6 ".parse::<GameType>().unwrap(), GameType::Dom6);
        let err = "dom4".parse::<GameType>().unwrap_err();
        assert!(err.to_string().contains("dom4"));
    }

    #[test]
    fn outbound_serializes_with_trigger_tag() {
        let msg = Outbound::StdioData {
            game_name: "Ulm".to_string(),
            game_type: GameType::Dom5,
            stream: StdioStream::Stderr,
            data: "oops".to_string(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["trigger"], msg.trigger());
        assert_eq!(v["payload"]["gameName"], "Ulm");
        assert_eq!(v["payload"]["type"], "dom5");
        assert_eq!(v["payload"]["stream"], "stderr");
    }

    #[test]
    fn settings_accept_missing_args() {
        let s: GameSettings =
            serde_json::from_str(r#"{"name":"g","type":"dom6","port":6001}"#).unwrap();
        assert!(s.args.is_empty());
        assert_eq!(s.key(), GameKey::new("g", GameType::Dom6));
    }
}
