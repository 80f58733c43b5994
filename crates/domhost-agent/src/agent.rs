use std::sync::Arc;

use domhost_process::Outbound;
use tracing::Instrument;

use crate::{
    config::AgentConfig,
    events::{self, HostEvent, HostEventReceiver, Reporter},
    game::GameEnv,
    hosted_games::HostedGames,
    port_probe::{self, PortProbe},
    rpc::AgentRpc,
    status_store::StatusStore,
};

/// Everything one agent process runs: the stores, the event router and the
/// command surface.
#[derive(Clone)]
pub struct Agent {
    games: HostedGames,
    status: StatusStore,
}

impl Agent {
    pub fn new(config: Arc<AgentConfig>, reporter: Arc<dyn Reporter>) -> Self {
        let probe = port_probe::from_config(&config);
        Self::with_probe(config, reporter, probe)
    }

    pub fn with_probe(
        config: Arc<AgentConfig>,
        reporter: Arc<dyn Reporter>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let (tx, rx) = events::channel();
        let env = GameEnv::new(config.clone(), tx);
        let games = HostedGames::new(env.clone(), probe);
        let status = StatusStore::new(env.paths.clone(), reporter.clone(), config.status_interval());

        tokio::spawn(
            route_events(rx, status.clone(), reporter).instrument(tracing::info_span!("event_router")),
        );

        Self { games, status }
    }

    #[cfg(test)]
    pub fn games(&self) -> &HostedGames {
        &self.games
    }

    pub fn rpc(&self) -> AgentRpc {
        AgentRpc::new(self.games.clone(), self.status.clone())
    }

    /// Loads on-disk statuses and starts the poll.
    pub async fn start(&self) {
        if let Err(e) = self.status.populate().await {
            tracing::warn!(error = %format!("{e:#}"), "initial status load failed");
        }
        self.status.start_update_cycle();
    }

    /// Drops speculative port reservations and kills every running game.
    pub async fn shutdown(&self) {
        let released = self.games.reserved().release_all_ports().await;
        let failed = self.games.kill_all_games().await;
        tracing::info!(released_ports = released, failed_kills = failed, "agent shut down");
    }
}

async fn route_events(mut rx: HostEventReceiver, status: StatusStore, reporter: Arc<dyn Reporter>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            HostEvent::Registered(game) => status.attach_game(game).await,
            HostEvent::Removed(key) => status.detach_game(&key).await,
            HostEvent::Online(key) => status.set_online(&key, true).await,
            HostEvent::Exited { key, .. } => status.update(&key).await,
            HostEvent::Closed { key, code } => {
                status.set_online(&key, false).await;
                reporter.emit(Outbound::GameClosed {
                    game_name: key.name,
                    game_type: key.game_type,
                    exit_code: code,
                });
            }
            HostEvent::Error { key, message } => reporter.emit(Outbound::GameError {
                game_name: key.name,
                game_type: key.game_type,
                message,
            }),
            HostEvent::Stdio { key, stream, data } => reporter.emit(Outbound::StdioData {
                game_name: key.name,
                game_type: key.game_type,
                stream,
                data,
            }),
        }
    }
    tracing::debug!("event bus closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use domhost_process::{GameSettings, GameType};
    use futures_util::future::BoxFuture;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        config::GameInstallConfig,
        events::ChannelReporter,
    };

    struct AlwaysFree;

    impl PortProbe for AlwaysFree {
        fn is_port_free(&self, _port: u16) -> BoxFuture<'_, bool> {
            Box::pin(async { true })
        }
    }

    fn agent(root: &std::path::Path, executable: &str) -> (Agent, UnboundedReceiver<Outbound>) {
        let mut cfg = AgentConfig {
            data_root: root.to_path_buf(),
            ..AgentConfig::default()
        };
        cfg.games.insert(
            "dom5".to_string(),
            GameInstallConfig {
                executable: executable.into(),
                savedgames: root.join("savedgames"),
            },
        );
        let (reporter, rx) = ChannelReporter::new();
        let agent = Agent::with_probe(Arc::new(cfg), Arc::new(reporter), Arc::new(AlwaysFree));
        (agent, rx)
    }

    fn settings(args: &[&str]) -> GameSettings {
        GameSettings {
            name: "Kingdoms".to_string(),
            game_type: GameType::Dom5,
            port: 6000,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    async fn next(rx: &mut UnboundedReceiver<Outbound>) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn each_populate_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, mut rx) = agent(dir.path(), "/nonexistent/dom5");

        agent.games().populate(vec![settings(&["--x"])]).await;
        let first = next(&mut rx).await.unwrap();
        assert!(matches!(&first, Outbound::GameUpdate(u) if u.game_name == "Kingdoms" && !u.is_online));

        agent.games().populate(vec![settings(&["--y"])]).await;
        assert!(matches!(next(&mut rx).await, Some(Outbound::GameUpdate(_))));

        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn launch_failure_becomes_game_error() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, mut rx) = agent(dir.path(), "/nonexistent/dom5");

        agent.games().request_hosting(&settings(&[])).await.unwrap();
        let mut saw_error = false;
        while let Some(msg) = next(&mut rx).await {
            if let Outbound::GameError { game_name, message, .. } = msg {
                assert_eq!(game_name, "Kingdoms");
                assert!(message.contains("/nonexistent/dom5"));
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_output_and_close_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        // echo stands in for the server: it prints its command line and exits.
        let (agent, mut rx) = agent(dir.path(), "/bin/echo");

        agent.games().request_hosting(&settings(&["--era", "1"])).await.unwrap();

        let mut stdout = None;
        let mut closed = None;
        while let Some(msg) = next(&mut rx).await {
            match msg {
                Outbound::StdioData { data, .. } => stdout = Some(data),
                Outbound::GameClosed { exit_code, .. } => {
                    closed = Some(exit_code);
                    break;
                }
                _ => {}
            }
        }
        let stdout = stdout.unwrap();
        assert!(stdout.starts_with("--era 1 --port 6000 --nosteam"));
        assert!(stdout.ends_with("Kingdoms"));
        assert_eq!(closed, Some(Some(0)));
        assert!(dir.path().join("logs/dom5/Kingdoms").is_dir());
    }
}
