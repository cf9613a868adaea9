//! Storage seams for the orchestration engine
//!
//! The engine talks to storage only through these traits:
//! - `SessionRepository` for session rows
//! - `PortRepository` for the transactional (server, port, protocol) ledger
//! - `CatalogRepository` for the operator-managed game catalog
//!
//! `PostgresStore` (see `adapters`) is the production implementation,
//! `InMemoryStore` mirrors its semantics for tests and local runs.

pub mod memory;

use async_trait::async_trait;

use crate::domain::{
    ConfigurationPatch, ConfigurationStrategy, GameConfig, NewSession, PatchScope, Protocol,
    ServerGameConfig, ServerPort, Session, SessionStatus,
};
use crate::error::Result;

pub use memory::InMemoryStore;

/// One (port, protocol) pair to reserve on a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRequest {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortRequest {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, new: NewSession) -> Result<Session>;

    /// Fails with `NotFound` for unknown ids
    async fn get_session(&self, session_id: i64) -> Result<Session>;

    /// Sessions of one SGC whose status is in `statuses`, oldest first
    async fn list_sessions_for_sgc(
        &self,
        sgc_id: i64,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>>;

    /// Set the status; terminal statuses also stamp `ended_at`
    async fn update_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
    ) -> Result<Session>;

    /// Mark every live session of the SGC except `keep_session_id` as stopped.
    /// Returns the ids that were changed.
    async fn stop_sibling_sessions(&self, sgc_id: i64, keep_session_id: i64) -> Result<Vec<i64>>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait PortRepository: Send + Sync {
    /// Reserve all requested triples for `session_id` in one transaction.
    /// Either every row is inserted or none is; a taken triple fails with
    /// `ManmanError::PortConflict`.
    async fn allocate_ports(
        &self,
        server_id: i64,
        requests: &[PortRequest],
        session_id: i64,
    ) -> Result<Vec<ServerPort>>;

    /// Delete every reservation owned by the session, returning the row count
    async fn release_session_ports(&self, session_id: i64) -> Result<u64>;

    async fn get_port(
        &self,
        server_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<Option<ServerPort>>;

    async fn list_server_ports(&self, server_id: i64) -> Result<Vec<ServerPort>>;

    async fn list_session_ports(&self, session_id: i64) -> Result<Vec<ServerPort>>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_server_game_config(&self, sgc_id: i64) -> Result<ServerGameConfig>;

    async fn get_game_config(&self, config_id: i64) -> Result<GameConfig>;

    /// All strategies of a game, in apply order
    async fn list_strategies(&self, game_id: i64) -> Result<Vec<ConfigurationStrategy>>;

    async fn find_patch(
        &self,
        strategy_id: i64,
        scope: PatchScope,
        entity_id: i64,
    ) -> Result<Option<ConfigurationPatch>>;
}
