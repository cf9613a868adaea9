#![allow(dead_code)]

use manman::domain::{GameConfig, PortBinding, ServerGameConfig};
use manman::messaging::InMemoryBroker;
use manman::persistence::{InMemoryStore, SessionRepository};
use manman::services::{CommandPublisher, RpcTimeouts, SessionHandler};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SERVER_ID: i64 = 1;
pub const SGC_ID: i64 = 20;
pub const GAME_CONFIG_ID: i64 = 10;
pub const GAME_ID: i64 = 1;

pub fn game_config() -> GameConfig {
    GameConfig {
        config_id: GAME_CONFIG_ID,
        game_id: GAME_ID,
        name: "vanilla".to_string(),
        image: "itzg/minecraft-server:latest".to_string(),
        args_template: "--nogui".to_string(),
        env_template: BTreeMap::from([("EULA".to_string(), "TRUE".to_string())]),
        files: Vec::new(),
        parameters: Vec::new(),
        entrypoint: Vec::new(),
        command: Vec::new(),
    }
}

pub fn server_game_config(sgc_id: i64, bindings: Vec<PortBinding>) -> ServerGameConfig {
    ServerGameConfig {
        sgc_id,
        server_id: SERVER_ID,
        game_config_id: GAME_CONFIG_ID,
        port_bindings: bindings,
        parameters: BTreeMap::new(),
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub broker: Arc<InMemoryBroker>,
    pub handler: Arc<SessionHandler>,
    pub shutdown: CancellationToken,
}

impl Harness {
    /// SGC 20 on server 1 binding 25565/TCP, with an acknowledging host agent
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.insert_game_config(game_config()).await;
        store
            .insert_server_game_config(server_game_config(SGC_ID, vec![PortBinding::tcp(25565)]))
            .await;
        Self::with_store(store, InMemoryBroker::acknowledging()).await
    }

    pub async fn with_store(store: Arc<InMemoryStore>, broker: InMemoryBroker) -> Self {
        Self::with_sessions(store.clone(), store, broker).await
    }

    /// Sessions served by `sessions`, everything else by `store`
    pub async fn with_sessions(
        sessions: Arc<dyn SessionRepository>,
        store: Arc<InMemoryStore>,
        broker: InMemoryBroker,
    ) -> Self {
        let broker = Arc::new(broker);
        let shutdown = CancellationToken::new();
        let publisher = CommandPublisher::start(broker.clone(), "manman", shutdown.clone())
            .await
            .expect("publisher starts");
        let handler = Arc::new(SessionHandler::new(
            sessions,
            store.clone(),
            store.clone(),
            publisher,
            RpcTimeouts {
                start: Duration::from_millis(300),
                stop: Duration::from_millis(300),
                send_input: Duration::from_millis(300),
            },
        ));
        Self {
            store,
            broker,
            handler,
            shutdown,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
