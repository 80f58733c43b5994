use domhost_process::{GameKey, GameSettings, GameType};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{
    domcmd::{self, GameCommand},
    error_payload,
    hosted_games::{HostError, HostedGames},
    kill::KillError,
    map_file::{self, MapError},
    status_store::StatusStore,
};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("invalid payload for {trigger}: {message}")]
    InvalidParam { trigger: String, message: String },
    #[error("unknown trigger: {0}")]
    UnknownTrigger(String),
}

#[derive(Debug, serde::Deserialize)]
struct RollbackRequest {
    #[serde(flatten)]
    key: GameKey,
    turn: u32,
}

#[derive(Debug, serde::Deserialize)]
struct PortRequest {
    port: u16,
}

#[derive(Debug, serde::Deserialize)]
struct RemovePretenderRequest {
    #[serde(flatten)]
    key: GameKey,
    nation: String,
}

#[derive(Debug, serde::Deserialize)]
struct ChangeTimerRequest {
    #[serde(flatten)]
    key: GameKey,
    #[serde(flatten)]
    command: GameCommand,
}

#[derive(Debug, serde::Deserialize)]
struct ValidateMapRequest {
    #[serde(rename = "type")]
    game_type: GameType,
    map: String,
    provinces: Option<u32>,
}

/// Maps coordinator triggers onto store operations.
#[derive(Clone)]
pub struct AgentRpc {
    games: HostedGames,
    status: StatusStore,
}

impl AgentRpc {
    pub fn new(games: HostedGames, status: StatusStore) -> Self {
        Self { games, status }
    }

    fn decode<T: DeserializeOwned>(trigger: &str, payload: Value) -> anyhow::Result<T> {
        serde_json::from_value(payload).map_err(|e| {
            RpcError::InvalidParam {
                trigger: trigger.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    pub async fn dispatch(&self, trigger: &str, payload: Value) -> anyhow::Result<Value> {
        match trigger {
            "POPULATE" => {
                let desired: Vec<GameSettings> = Self::decode(trigger, payload)?;
                Ok(json!(self.games.populate(desired).await))
            }
            "HOST_GAME" => {
                let settings: GameSettings = Self::decode(trigger, payload)?;
                Ok(json!(self.games.request_hosting(&settings).await?))
            }
            "KILL_GAME" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                self.games.kill_game(&key).await?;
                Ok(json!({}))
            }
            "RESTART_GAME" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                Ok(json!(self.games.restart_game(&key).await?))
            }
            "RESET_PORT" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                let port = self.games.reset_port(&key).await?;
                Ok(json!({ "port": port }))
            }
            "DELETE_GAME" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                self.games.delete_game(&key).await?;
                Ok(json!({}))
            }
            "DELETE_GAME_DATA" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                self.games.delete_game_data(&key).await?;
                Ok(json!({}))
            }
            "OVERWRITE_SETTINGS" => {
                let settings: GameSettings = Self::decode(trigger, payload)?;
                let removed = self.games.overwrite_settings(&settings).await?;
                Ok(json!({ "startedMarkerRemoved": removed }))
            }
            "HAS_STARTED" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                Ok(json!({ "started": self.games.has_started(&key).await? }))
            }
            "ROLLBACK" => {
                let req: RollbackRequest = Self::decode(trigger, payload)?;
                self.games.rollback(&req.key, req.turn).await?;
                Ok(json!({}))
            }
            "RESERVE_PORT" => {
                let port = self.games.reserve_port().await.ok_or(HostError::NoFreePort)?;
                Ok(json!({ "port": port }))
            }
            "RELEASE_PORT" => {
                let req: PortRequest = Self::decode(trigger, payload)?;
                let released = self.games.reserved().release_port(req.port).await;
                Ok(json!({ "released": released }))
            }
            "RELEASE_ALL_PORTS" => {
                let released = self.games.reserved().release_all_ports().await;
                Ok(json!({ "released": released }))
            }
            "GET_SUBMITTED_PRETENDERS" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                Ok(json!(self.status.submitted_pretenders(&key).await?))
            }
            "REMOVE_PRETENDER" => {
                let req: RemovePretenderRequest = Self::decode(trigger, payload)?;
                let removed = self.status.remove_pretender(&req.key, &req.nation).await?;
                Ok(json!({ "removed": removed }))
            }
            "GET_UNDONE_TURNS" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                Ok(json!(self.status.undone_turns(&key).await?))
            }
            "GET_UNCHECKED_TURNS" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                Ok(json!(self.status.unchecked_turns(&key).await?))
            }
            "GET_STALES" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                Ok(json!(self.status.fetch_stales(&key).await?))
            }
            "CHANGE_TIMER" => {
                let req: ChangeTimerRequest = Self::decode(trigger, payload)?;
                domcmd::write_command_file(&self.games.env().paths, &req.key, &req.command).await?;
                Ok(json!({}))
            }
            "FORCE_STATUS_UPDATE" => {
                let key: GameKey = Self::decode(trigger, payload)?;
                self.status.force_update(&key).await?;
                Ok(json!({}))
            }
            "VALIDATE_MAP" => {
                let req: ValidateMapRequest = Self::decode(trigger, payload)?;
                let path = self.games.env().paths.map_file(req.game_type, &req.map)?;
                Ok(json!(map_file::validate_map(&path, req.provinces).await?))
            }
            other => Err(RpcError::UnknownTrigger(other.to_string()).into()),
        }
    }
}

/// Encodes an operation failure for the coordinator.
pub fn encode_error(err: &anyhow::Error) -> String {
    let message = format!("{err:#}");
    if let Some(e) = err.downcast_ref::<HostError>() {
        return match e {
            HostError::UnknownGame(_) => error_payload::encode(error_payload::UNKNOWN_GAME, message, None),
            HostError::PortBusy { .. } | HostError::PortTaken { .. } | HostError::NoFreePort => {
                error_payload::encode(error_payload::PORT_BUSY, message, None)
            }
            HostError::Launch { .. } => error_payload::encode(error_payload::LAUNCH_FAILED, message, None),
            HostError::Kill(_) => kill_failed(message),
        };
    }
    if err.downcast_ref::<KillError>().is_some() {
        return kill_failed(message);
    }
    if err.downcast_ref::<RpcError>().is_some() || err.chain().any(|c| c.is::<MapError>()) {
        return error_payload::encode(error_payload::INVALID_PARAM, message, None);
    }
    error_payload::encode(error_payload::INTERNAL, message, None)
}

fn kill_failed(message: String) -> String {
    error_payload::encode(
        error_payload::KILL_FAILED,
        message,
        Some("the game may still be shutting down; try again later".to_string()),
    )
}
