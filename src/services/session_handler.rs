//! Session Handler
//!
//! Orchestrates the session lifecycle: conflict checks, session rows, port
//! reservations, configuration rendering and host commands. The session row
//! is the source of truth. Start and stop commands are best-effort; their
//! outcome only shows up in the logs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::{
    GameConfig, NewSession, ServerGameConfig, Session, SessionParameters, SessionStatus,
};
use crate::error::{ManmanError, Result};
use crate::messaging::{
    GameConfigPayload, HostAction, SendInputCommand, ServerGameConfigPayload,
    StartSessionCommand, StopSessionCommand,
};
use crate::persistence::{CatalogRepository, PortRepository, SessionRepository};
use crate::services::command_publisher::CommandPublisher;
use crate::services::config_resolver::{ConfigResolver, ResolvedConfiguration};
use crate::services::port_allocator::PortAllocator;

/// Per-action bounds on waiting for a host agent reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTimeouts {
    /// Covers image pulls
    pub start: Duration,
    pub stop: Duration,
    pub send_input: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(120),
            stop: Duration::from_secs(60),
            send_input: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub sgc_id: i64,
    #[serde(default)]
    pub parameters: SessionParameters,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub restore_backup_id: Option<i64>,
}

impl StartSessionRequest {
    pub fn new(sgc_id: i64) -> Self {
        Self {
            sgc_id,
            ..Default::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// What a force override changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForceOverrideReport {
    /// Live siblings marked stopped without a host round-trip
    pub stopped_sessions: Vec<i64>,
    /// Terminal sessions whose ports were released
    pub reclaimed_sessions: Vec<i64>,
    /// Terminal sessions whose ports could not be released, with the reason
    pub failed_reclaims: Vec<(i64, String)>,
}

pub struct SessionHandler {
    sessions: Arc<dyn SessionRepository>,
    catalog: Arc<dyn CatalogRepository>,
    ports: PortAllocator,
    resolver: ConfigResolver,
    publisher: Arc<CommandPublisher>,
    timeouts: RpcTimeouts,
}

impl SessionHandler {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        catalog: Arc<dyn CatalogRepository>,
        ports: Arc<dyn PortRepository>,
        publisher: Arc<CommandPublisher>,
        timeouts: RpcTimeouts,
    ) -> Self {
        Self {
            sessions,
            resolver: ConfigResolver::new(Arc::clone(&catalog)),
            catalog,
            ports: PortAllocator::new(ports),
            publisher,
            timeouts,
        }
    }

    pub fn port_allocator(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn timeouts(&self) -> RpcTimeouts {
        self.timeouts
    }

    /// Start a new session of an SGC.
    ///
    /// Without `force`, any pending/starting/running/stopping session of the
    /// SGC makes this fail with `FailedPrecondition`. Crashed and lost
    /// sessions never block. With `force`, siblings are stopped and stale
    /// ports are reclaimed first (see [`Self::force_override`]).
    #[instrument(skip(self, request, cancel), fields(sgc_id = request.sgc_id, force = request.force))]
    pub async fn start_session(
        &self,
        request: StartSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let sgc_id = request.sgc_id;
        let existing = self
            .sessions
            .list_sessions_for_sgc(sgc_id, &SessionStatus::LIVE)
            .await?;

        if let Some(active) = existing.iter().find(|s| s.status.blocks_new_start()) {
            if !request.force {
                return Err(ManmanError::FailedPrecondition(format!(
                    "server game config {} already has session {} in state {}",
                    sgc_id, active.session_id, active.status
                )));
            }
            info!(
                "Force start overriding session {} ({})",
                active.session_id, active.status
            );
        }

        let session = self
            .sessions
            .create_session(NewSession {
                sgc_id,
                parameters: request.parameters,
                restore_backup_id: request.restore_backup_id,
            })
            .await?;
        info!("Created session {} for sgc {}", session.session_id, sgc_id);

        if request.force {
            match self.force_override(sgc_id, session.session_id).await {
                Ok(report) => info!(
                    "Force override for sgc {}: stopped {:?}, reclaimed {:?}, {} failed reclaims",
                    sgc_id,
                    report.stopped_sessions,
                    report.reclaimed_sessions,
                    report.failed_reclaims.len()
                ),
                Err(e) => {
                    warn!(
                        "Force override failed for session {}: {}",
                        session.session_id, e
                    );
                    self.mark_crashed(session.session_id).await;
                    return Err(e);
                }
            }
        }

        let (sgc, game_config) = match self.load_catalog(sgc_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.mark_crashed(session.session_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .ports
            .allocate_multiple_ports(sgc.server_id, &sgc.port_bindings, session.session_id)
            .await
        {
            warn!(
                "Port allocation failed for session {}: {}",
                session.session_id, e
            );
            self.mark_crashed(session.session_id).await;
            return Err(e);
        }

        let resolved = match self
            .resolver
            .resolve(game_config.game_id, game_config.config_id, sgc_id)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "Configuration resolution failed for session {}: {}",
                    session.session_id, e
                );
                self.mark_crashed(session.session_id).await;
                self.release_ports_logged(session.session_id).await;
                return Err(e);
            }
        };

        let command =
            build_start_command(&session, &sgc, &game_config, resolved, request.force);
        match self
            .publisher
            .call(
                sgc.server_id,
                HostAction::Start,
                &command,
                self.timeouts.start,
                cancel,
            )
            .await
        {
            Ok(reply) if reply.success => {
                info!("Host {} accepted start of session {}", sgc.server_id, session.session_id)
            }
            Ok(reply) => warn!(
                "Host {} rejected start of session {}: {}",
                sgc.server_id,
                session.session_id,
                reply.error_message()
            ),
            Err(e) => warn!(
                "Start command for session {} not confirmed: {}",
                session.session_id, e
            ),
        }

        Ok(session)
    }

    /// Stop every other live session of the SGC and release the ports of its
    /// terminal sessions. `keep_session_id` is left untouched.
    ///
    /// A reclaim that fails is logged and reported, never fatal.
    #[instrument(skip(self))]
    pub async fn force_override(
        &self,
        sgc_id: i64,
        keep_session_id: i64,
    ) -> Result<ForceOverrideReport> {
        let mut report = ForceOverrideReport {
            stopped_sessions: self
                .sessions
                .stop_sibling_sessions(sgc_id, keep_session_id)
                .await?,
            ..Default::default()
        };
        for id in &report.stopped_sessions {
            info!("Session {} stopped by force override", id);
        }

        let terminal = self
            .sessions
            .list_sessions_for_sgc(sgc_id, &SessionStatus::TERMINAL)
            .await?;

        for session in terminal.iter().filter(|s| s.session_id != keep_session_id) {
            match self
                .ports
                .deallocate_ports_by_session_id(session.session_id)
                .await
            {
                Ok(0) => {}
                Ok(_) => report.reclaimed_sessions.push(session.session_id),
                Err(e) => {
                    warn!(
                        "Could not reclaim ports of session {}: {}",
                        session.session_id, e
                    );
                    report
                        .failed_reclaims
                        .push((session.session_id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Ask the host to stop the session, mark it stopping and free its ports.
    ///
    /// The host round-trip is best-effort. Terminal sessions only get their
    /// ports released and are returned as they are. A lost session may still
    /// have a container behind it, so it is sent `stop` as well.
    #[instrument(skip(self, cancel))]
    pub async fn stop_session(&self, session_id: i64, cancel: &CancellationToken) -> Result<Session> {
        let session = self.sessions.get_session(session_id).await?;
        if session.status.is_terminal() {
            if session.status == SessionStatus::Lost {
                self.publish_stop(&session, cancel).await?;
            }
            self.ports.deallocate_ports_by_session_id(session_id).await?;
            return Ok(session);
        }

        self.publish_stop(&session, cancel).await?;

        let session = match session.status {
            SessionStatus::Stopping => session,
            _ => self.transition(&session, SessionStatus::Stopping).await?,
        };
        self.ports.deallocate_ports_by_session_id(session_id).await?;
        info!("Session {} stopping", session_id);
        Ok(session)
    }

    /// Publish `stop` and log the outcome. Only the SGC lookup can fail.
    async fn publish_stop(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        let sgc = self.catalog.get_server_game_config(session.sgc_id).await?;
        let command = StopSessionCommand {
            session_id: session.session_id,
            sgc_id: session.sgc_id,
            force: false,
        };
        match self
            .publisher
            .call(
                sgc.server_id,
                HostAction::Stop,
                &command,
                self.timeouts.stop,
                cancel,
            )
            .await
        {
            Ok(reply) if reply.success => {}
            Ok(reply) => warn!(
                "Host {} rejected stop of session {}: {}",
                sgc.server_id,
                session.session_id,
                reply.error_message()
            ),
            Err(e) => warn!(
                "Stop command for session {} not confirmed: {}",
                session.session_id, e
            ),
        }
        Ok(())
    }

    /// Forward console input to a running session and wait for the host to
    /// acknowledge it
    #[instrument(skip(self, input, cancel), fields(bytes = input.len()))]
    pub async fn send_input(
        &self,
        session_id: i64,
        input: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = self.sessions.get_session(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(ManmanError::FailedPrecondition(format!(
                "session {} is {}, input requires running",
                session_id, session.status
            )));
        }

        let sgc = self.catalog.get_server_game_config(session.sgc_id).await?;
        let command = SendInputCommand {
            session_id,
            sgc_id: session.sgc_id,
            input,
        };
        let reply = self
            .publisher
            .call(
                sgc.server_id,
                HostAction::SendInput,
                &command,
                self.timeouts.send_input,
                cancel,
            )
            .await?;

        if !reply.success {
            return Err(ManmanError::AgentRejected {
                action: HostAction::SendInput.as_str().to_string(),
                reason: reply.error_message().to_string(),
            });
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Session> {
        self.sessions.get_session(session_id).await
    }

    /// Sessions of an SGC, optionally restricted to some statuses
    pub async fn list_sessions(
        &self,
        sgc_id: i64,
        statuses: Option<&[SessionStatus]>,
    ) -> Result<Vec<Session>> {
        self.sessions
            .list_sessions_for_sgc(sgc_id, statuses.unwrap_or(&SessionStatus::ALL))
            .await
    }

    /// Storage reachability
    pub async fn health_check(&self) -> Result<()> {
        self.sessions.health_check().await
    }

    async fn load_catalog(&self, sgc_id: i64) -> Result<(ServerGameConfig, GameConfig)> {
        let sgc = self.catalog.get_server_game_config(sgc_id).await?;
        let game_config = self.catalog.get_game_config(sgc.game_config_id).await?;
        Ok((sgc, game_config))
    }

    async fn transition(&self, session: &Session, target: SessionStatus) -> Result<Session> {
        if !session.status.can_transition_to(target) {
            return Err(ManmanError::InvalidStateTransition {
                from: session.status.to_string(),
                to: target.to_string(),
            });
        }
        self.sessions
            .update_session_status(session.session_id, target)
            .await
    }

    async fn mark_crashed(&self, session_id: i64) {
        if let Err(e) = self
            .sessions
            .update_session_status(session_id, SessionStatus::Crashed)
            .await
        {
            error!("Failed to mark session {} crashed: {}", session_id, e);
        }
    }

    async fn release_ports_logged(&self, session_id: i64) {
        if let Err(e) = self.ports.deallocate_ports_by_session_id(session_id).await {
            error!("Failed to release ports of session {}: {}", session_id, e);
        }
    }
}

/// Assemble the `start` payload for a freshly created session
pub fn build_start_command(
    session: &Session,
    sgc: &ServerGameConfig,
    game_config: &GameConfig,
    resolved: ResolvedConfiguration,
    force: bool,
) -> StartSessionCommand {
    StartSessionCommand {
        session_id: session.session_id,
        sgc_id: sgc.sgc_id,
        game_config: GameConfigPayload::new(game_config, resolved.volumes),
        server_game_config: ServerGameConfigPayload::from(sgc),
        parameters: session.parameters.clone(),
        force,
        configurations: resolved.configurations,
    }
}
