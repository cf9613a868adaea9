//! In-memory storage with the same guarantees as the PostgreSQL schema
//!
//! A single mutex stands in for the database transaction: port allocation
//! checks and inserts under one lock acquisition, so a batch is applied
//! entirely or not at all and the (server, port, protocol) key stays unique.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CatalogRepository, PortRepository, PortRequest, SessionRepository};
use crate::domain::{
    ConfigurationPatch, ConfigurationStrategy, GameConfig, NewSession, PatchScope, Protocol,
    ServerGameConfig, ServerPort, Session, SessionStatus,
};
use crate::error::{ManmanError, PortConflict, Result};

type PortKey = (i64, u16, Protocol);

#[derive(Default)]
struct State {
    next_session_id: i64,
    sessions: BTreeMap<i64, Session>,
    ports: HashMap<PortKey, ServerPort>,
    server_game_configs: HashMap<i64, ServerGameConfig>,
    game_configs: HashMap<i64, GameConfig>,
    strategies: Vec<ConfigurationStrategy>,
    patches: Vec<ConfigurationPatch>,
}

/// Process-local store for tests and development
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Seeding ====================

    pub async fn insert_server_game_config(&self, sgc: ServerGameConfig) {
        self.state
            .lock()
            .await
            .server_game_configs
            .insert(sgc.sgc_id, sgc);
    }

    pub async fn insert_game_config(&self, config: GameConfig) {
        self.state
            .lock()
            .await
            .game_configs
            .insert(config.config_id, config);
    }

    pub async fn insert_strategy(&self, strategy: ConfigurationStrategy) {
        let mut state = self.state.lock().await;
        state
            .strategies
            .retain(|s| s.strategy_id != strategy.strategy_id);
        state.strategies.push(strategy);
    }

    pub async fn insert_patch(&self, patch: ConfigurationPatch) {
        let mut state = self.state.lock().await;
        state.patches.retain(|p| {
            !(p.strategy_id == patch.strategy_id
                && p.scope == patch.scope
                && p.entity_id == patch.entity_id)
        });
        state.patches.push(patch);
    }

    /// Number of session rows, regardless of status
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

#[async_trait]
impl SessionRepository for InMemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<Session> {
        let mut state = self.state.lock().await;
        state.next_session_id += 1;
        let now = Utc::now();
        let session = Session {
            session_id: state.next_session_id,
            sgc_id: new.sgc_id,
            status: SessionStatus::Pending,
            started_at: None,
            ended_at: None,
            exit_code: None,
            parameters: new.parameters,
            restore_backup_id: new.restore_backup_id,
            created_at: now,
            updated_at: now,
        };
        state.sessions.insert(session.session_id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: i64) -> Result<Session> {
        self.state
            .lock()
            .await
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| ManmanError::not_found("session", session_id))
    }

    async fn list_sessions_for_sgc(
        &self,
        sgc_id: i64,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.sgc_id == sgc_id && statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn update_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
    ) -> Result<Session> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| ManmanError::not_found("session", session_id))?;

        let now = Utc::now();
        session.status = status;
        session.updated_at = now;
        if status == SessionStatus::Running && session.started_at.is_none() {
            session.started_at = Some(now);
        }
        if status.is_terminal() {
            session.ended_at = Some(now);
        }
        Ok(session.clone())
    }

    async fn stop_sibling_sessions(&self, sgc_id: i64, keep_session_id: i64) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut stopped = Vec::new();
        for session in state.sessions.values_mut() {
            if session.sgc_id == sgc_id
                && session.session_id != keep_session_id
                && session.status.is_live()
            {
                session.status = SessionStatus::Stopped;
                session.updated_at = now;
                session.ended_at = Some(now);
                stopped.push(session.session_id);
            }
        }
        Ok(stopped)
    }
}

#[async_trait]
impl PortRepository for InMemoryStore {
    async fn allocate_ports(
        &self,
        server_id: i64,
        requests: &[PortRequest],
        session_id: i64,
    ) -> Result<Vec<ServerPort>> {
        let mut state = self.state.lock().await;

        for req in requests {
            if let Some(existing) = state.ports.get(&(server_id, req.port, req.protocol)) {
                return Err(PortConflict {
                    server_id,
                    port: req.port,
                    protocol: req.protocol,
                    owner_session_id: Some(existing.session_id),
                }
                .into());
            }
        }

        let now = Utc::now();
        let allocated: Vec<ServerPort> = requests
            .iter()
            .map(|req| ServerPort {
                server_id,
                port: req.port,
                protocol: req.protocol,
                session_id,
                allocated_at: now,
            })
            .collect();
        for port in &allocated {
            state
                .ports
                .insert((port.server_id, port.port, port.protocol), port.clone());
        }

        debug!(
            "Allocated {} ports on server {} for session {}",
            allocated.len(),
            server_id,
            session_id
        );
        Ok(allocated)
    }

    async fn release_session_ports(&self, session_id: i64) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.ports.len();
        state.ports.retain(|_, p| p.session_id != session_id);
        Ok((before - state.ports.len()) as u64)
    }

    async fn get_port(
        &self,
        server_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<Option<ServerPort>> {
        Ok(self
            .state
            .lock()
            .await
            .ports
            .get(&(server_id, port, protocol))
            .cloned())
    }

    async fn list_server_ports(&self, server_id: i64) -> Result<Vec<ServerPort>> {
        let mut ports: Vec<ServerPort> = self
            .state
            .lock()
            .await
            .ports
            .values()
            .filter(|p| p.server_id == server_id)
            .cloned()
            .collect();
        ports.sort_by_key(|p| (p.port, p.protocol));
        Ok(ports)
    }

    async fn list_session_ports(&self, session_id: i64) -> Result<Vec<ServerPort>> {
        let mut ports: Vec<ServerPort> = self
            .state
            .lock()
            .await
            .ports
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        ports.sort_by_key(|p| (p.server_id, p.port, p.protocol));
        Ok(ports)
    }
}

#[async_trait]
impl CatalogRepository for InMemoryStore {
    async fn get_server_game_config(&self, sgc_id: i64) -> Result<ServerGameConfig> {
        self.state
            .lock()
            .await
            .server_game_configs
            .get(&sgc_id)
            .cloned()
            .ok_or_else(|| ManmanError::not_found("server game config", sgc_id))
    }

    async fn get_game_config(&self, config_id: i64) -> Result<GameConfig> {
        self.state
            .lock()
            .await
            .game_configs
            .get(&config_id)
            .cloned()
            .ok_or_else(|| ManmanError::not_found("game config", config_id))
    }

    async fn list_strategies(&self, game_id: i64) -> Result<Vec<ConfigurationStrategy>> {
        let mut strategies: Vec<ConfigurationStrategy> = self
            .state
            .lock()
            .await
            .strategies
            .iter()
            .filter(|s| s.game_id == game_id)
            .cloned()
            .collect();
        strategies.sort_by_key(|s| (s.apply_order, s.strategy_id));
        Ok(strategies)
    }

    async fn find_patch(
        &self,
        strategy_id: i64,
        scope: PatchScope,
        entity_id: i64,
    ) -> Result<Option<ConfigurationPatch>> {
        Ok(self
            .state
            .lock()
            .await
            .patches
            .iter()
            .find(|p| p.strategy_id == strategy_id && p.scope == scope && p.entity_id == entity_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocation_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store
            .allocate_ports(1, &[PortRequest::new(27015, Protocol::Udp)], 10)
            .await
            .unwrap();

        let err = store
            .allocate_ports(
                1,
                &[
                    PortRequest::new(27016, Protocol::Udp),
                    PortRequest::new(27015, Protocol::Udp),
                ],
                11,
            )
            .await
            .unwrap_err();

        match err {
            ManmanError::PortConflict(conflict) => {
                assert_eq!(conflict.port, 27015);
                assert_eq!(conflict.owner_session_id, Some(10));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store
            .get_port(1, 27016, Protocol::Udp)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_same_port_different_protocol_or_server() {
        let store = InMemoryStore::new();
        store
            .allocate_ports(1, &[PortRequest::new(25565, Protocol::Tcp)], 1)
            .await
            .unwrap();
        store
            .allocate_ports(1, &[PortRequest::new(25565, Protocol::Udp)], 2)
            .await
            .unwrap();
        store
            .allocate_ports(2, &[PortRequest::new(25565, Protocol::Tcp)], 3)
            .await
            .unwrap();

        assert_eq!(store.list_server_ports(1).await.unwrap().len(), 2);
        assert_eq!(store.release_session_ports(1).await.unwrap(), 1);
        assert_eq!(store.release_session_ports(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_siblings_skips_kept_and_terminal() {
        let store = InMemoryStore::new();
        let a = store
            .create_session(NewSession {
                sgc_id: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .create_session(NewSession {
                sgc_id: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        let c = store
            .create_session(NewSession {
                sgc_id: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update_session_status(b.session_id, SessionStatus::Completed)
            .await
            .unwrap();

        let stopped = store.stop_sibling_sessions(5, c.session_id).await.unwrap();
        assert_eq!(stopped, vec![a.session_id]);
        assert_eq!(
            store.get_session(b.session_id).await.unwrap().status,
            SessionStatus::Completed
        );
        assert_eq!(
            store.get_session(c.session_id).await.unwrap().status,
            SessionStatus::Pending
        );
    }
}
