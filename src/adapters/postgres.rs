use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use super::transaction_manager::{TransactionManager, TransactionScope};
use crate::domain::{
    ConfigurationPatch, ConfigurationStrategy, FileTemplate, GameConfig, NewSession,
    ParameterDefinition, PatchScope, PortBinding, Protocol, RenderOptions, ServerGameConfig,
    ServerPort, Session, SessionParameters, SessionStatus, StrategyType,
};
use crate::error::{ManmanError, PortConflict, Result};
use crate::persistence::{CatalogRepository, PortRepository, PortRequest, SessionRepository};

const SESSION_COLUMNS: &str = "session_id, sgc_id, status, started_at, ended_at, exit_code, \
     parameters, restore_backup_id, created_at, updated_at";

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    transactions: TransactionManager,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        let transactions = TransactionManager::new(pool.clone());
        Self { pool, transactions }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn port_owner(&self, server_id: i64, req: &PortRequest) -> Result<Option<i64>> {
        let owner = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT session_id FROM server_ports
            WHERE server_id = $1 AND port = $2 AND protocol = $3
            "#,
        )
        .bind(server_id)
        .bind(i32::from(req.port))
        .bind(req.protocol.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }
}

// ==================== Row mapping ====================

fn corrupt(what: &str, detail: impl std::fmt::Display) -> ManmanError {
    ManmanError::Internal(format!("corrupt {} in storage: {}", what, detail))
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let status: String = row.try_get("status")?;
    let parameters: Json<SessionParameters> = row.try_get("parameters")?;
    Ok(Session {
        session_id: row.try_get("session_id")?,
        sgc_id: row.try_get("sgc_id")?,
        status: SessionStatus::try_from(status.as_str()).map_err(|e| corrupt("session status", e))?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        exit_code: row.try_get("exit_code")?,
        parameters: parameters.0,
        restore_backup_id: row.try_get("restore_backup_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn server_port_from_row(row: &PgRow) -> Result<ServerPort> {
    let port: i32 = row.try_get("port")?;
    let protocol: String = row.try_get("protocol")?;
    Ok(ServerPort {
        server_id: row.try_get("server_id")?,
        port: u16::try_from(port).map_err(|e| corrupt("port", e))?,
        protocol: protocol
            .parse::<Protocol>()
            .map_err(|e| corrupt("protocol", e))?,
        session_id: row.try_get("session_id")?,
        allocated_at: row.try_get("allocated_at")?,
    })
}

fn strategy_from_row(row: &PgRow) -> Result<ConfigurationStrategy> {
    let strategy_type: String = row.try_get("strategy_type")?;
    let render_options: Json<RenderOptions> = row.try_get("render_options")?;
    Ok(ConfigurationStrategy {
        strategy_id: row.try_get("strategy_id")?,
        game_id: row.try_get("game_id")?,
        name: row.try_get("name")?,
        strategy_type: StrategyType::try_from(strategy_type.as_str())
            .map_err(|e| corrupt("strategy type", e))?,
        target_path: row.try_get("target_path")?,
        base_template: row.try_get("base_template")?,
        render_options: render_options.0,
        apply_order: row.try_get("apply_order")?,
    })
}

#[async_trait]
impl SessionRepository for PostgresStore {
    #[instrument(skip(self, new), fields(sgc_id = new.sgc_id))]
    async fn create_session(&self, new: NewSession) -> Result<Session> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sessions (sgc_id, status, parameters, restore_backup_id)
            VALUES ($1, $2, $3, $4)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(new.sgc_id)
        .bind(SessionStatus::Pending.as_str())
        .bind(Json(&new.parameters))
        .bind(new.restore_backup_id)
        .fetch_one(&self.pool)
        .await?;

        session_from_row(&row)
    }

    async fn get_session(&self, session_id: i64) -> Result<Session> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => session_from_row(&row),
            None => Err(ManmanError::not_found("session", session_id)),
        }
    }

    async fn list_sessions_for_sgc(
        &self,
        sgc_id: i64,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE sgc_id = $1 AND status = ANY($2)
            ORDER BY created_at ASC, session_id ASC
            "#
        ))
        .bind(sgc_id)
        .bind(statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn update_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
    ) -> Result<Session> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sessions SET
                status = $2,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                ended_at = CASE WHEN $3 THEN NOW() ELSE ended_at END,
                updated_at = NOW()
            WHERE session_id = $1
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => session_from_row(&row),
            None => Err(ManmanError::not_found("session", session_id)),
        }
    }

    #[instrument(skip(self))]
    async fn stop_sibling_sessions(&self, sgc_id: i64, keep_session_id: i64) -> Result<Vec<i64>> {
        let live: Vec<String> = SessionStatus::LIVE
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut tx = self.transactions.begin(TransactionScope::SiblingStop).await?;
        let stopped: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE sessions SET
                status = 'stopped',
                ended_at = NOW(),
                updated_at = NOW()
            WHERE sgc_id = $1 AND session_id <> $2 AND status = ANY($3)
            RETURNING session_id
            "#,
        )
        .bind(sgc_id)
        .bind(keep_session_id)
        .bind(live)
        .fetch_all(tx.executor()?)
        .await?;
        tx.commit().await?;

        Ok(stopped)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PortRepository for PostgresStore {
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    async fn allocate_ports(
        &self,
        server_id: i64,
        requests: &[PortRequest],
        session_id: i64,
    ) -> Result<Vec<ServerPort>> {
        let mut tx = self
            .transactions
            .begin(TransactionScope::PortAllocation)
            .await?;

        // Fail fast; the primary key below is what actually guards the triple
        for req in requests {
            let owner = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT session_id FROM server_ports
                WHERE server_id = $1 AND port = $2 AND protocol = $3
                "#,
            )
            .bind(server_id)
            .bind(i32::from(req.port))
            .bind(req.protocol.as_str())
            .fetch_optional(tx.executor()?)
            .await?;

            if let Some(owner) = owner {
                tx.rollback().await?;
                return Err(PortConflict {
                    server_id,
                    port: req.port,
                    protocol: req.protocol,
                    owner_session_id: Some(owner),
                }
                .into());
            }
        }

        let mut allocated = Vec::with_capacity(requests.len());
        for req in requests {
            let inserted = sqlx::query_scalar::<_, DateTime<Utc>>(
                r#"
                INSERT INTO server_ports (server_id, port, protocol, session_id, allocated_at)
                VALUES ($1, $2, $3, $4, NOW())
                RETURNING allocated_at
                "#,
            )
            .bind(server_id)
            .bind(i32::from(req.port))
            .bind(req.protocol.as_str())
            .bind(session_id)
            .fetch_one(tx.executor()?)
            .await;

            match inserted {
                Ok(allocated_at) => allocated.push(ServerPort {
                    server_id,
                    port: req.port,
                    protocol: req.protocol,
                    session_id,
                    allocated_at,
                }),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tx.rollback().await?;
                    let owner_session_id = self.port_owner(server_id, req).await?;
                    return Err(PortConflict {
                        server_id,
                        port: req.port,
                        protocol: req.protocol,
                        owner_session_id,
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        debug!(
            "Allocated {} ports on server {} for session {}",
            allocated.len(),
            server_id,
            session_id
        );
        Ok(allocated)
    }

    #[instrument(skip(self))]
    async fn release_session_ports(&self, session_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM server_ports WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_port(
        &self,
        server_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<Option<ServerPort>> {
        let row = sqlx::query(
            r#"
            SELECT server_id, port, protocol, session_id, allocated_at
            FROM server_ports
            WHERE server_id = $1 AND port = $2 AND protocol = $3
            "#,
        )
        .bind(server_id)
        .bind(i32::from(port))
        .bind(protocol.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(server_port_from_row).transpose()
    }

    async fn list_server_ports(&self, server_id: i64) -> Result<Vec<ServerPort>> {
        let rows = sqlx::query(
            r#"
            SELECT server_id, port, protocol, session_id, allocated_at
            FROM server_ports
            WHERE server_id = $1
            ORDER BY port ASC, protocol ASC
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(server_port_from_row).collect()
    }

    async fn list_session_ports(&self, session_id: i64) -> Result<Vec<ServerPort>> {
        let rows = sqlx::query(
            r#"
            SELECT server_id, port, protocol, session_id, allocated_at
            FROM server_ports
            WHERE session_id = $1
            ORDER BY server_id ASC, port ASC, protocol ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(server_port_from_row).collect()
    }
}

#[async_trait]
impl CatalogRepository for PostgresStore {
    async fn get_server_game_config(&self, sgc_id: i64) -> Result<ServerGameConfig> {
        let row = sqlx::query(
            r#"
            SELECT sgc_id, server_id, game_config_id, port_bindings, parameters
            FROM server_game_configs WHERE sgc_id = $1
            "#,
        )
        .bind(sgc_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ManmanError::not_found("server game config", sgc_id))?;

        let port_bindings: Json<Vec<PortBinding>> = row.try_get("port_bindings")?;
        let parameters: Json<BTreeMap<String, String>> = row.try_get("parameters")?;
        Ok(ServerGameConfig {
            sgc_id: row.try_get("sgc_id")?,
            server_id: row.try_get("server_id")?,
            game_config_id: row.try_get("game_config_id")?,
            port_bindings: port_bindings.0,
            parameters: parameters.0,
        })
    }

    async fn get_game_config(&self, config_id: i64) -> Result<GameConfig> {
        let row = sqlx::query(
            r#"
            SELECT config_id, game_id, name, image, args_template, env_template,
                   files, parameters, entrypoint, command
            FROM game_configs WHERE config_id = $1
            "#,
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ManmanError::not_found("game config", config_id))?;

        let env_template: Json<BTreeMap<String, String>> = row.try_get("env_template")?;
        let files: Json<Vec<FileTemplate>> = row.try_get("files")?;
        let parameters: Json<Vec<ParameterDefinition>> = row.try_get("parameters")?;
        let entrypoint: Json<Vec<String>> = row.try_get("entrypoint")?;
        let command: Json<Vec<String>> = row.try_get("command")?;
        Ok(GameConfig {
            config_id: row.try_get("config_id")?,
            game_id: row.try_get("game_id")?,
            name: row.try_get("name")?,
            image: row.try_get("image")?,
            args_template: row.try_get("args_template")?,
            env_template: env_template.0,
            files: files.0,
            parameters: parameters.0,
            entrypoint: entrypoint.0,
            command: command.0,
        })
    }

    async fn list_strategies(&self, game_id: i64) -> Result<Vec<ConfigurationStrategy>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_id, game_id, name, strategy_type, target_path,
                   base_template, render_options, apply_order
            FROM configuration_strategies
            WHERE game_id = $1
            ORDER BY apply_order ASC, strategy_id ASC
            "#,
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(strategy_from_row).collect()
    }

    async fn find_patch(
        &self,
        strategy_id: i64,
        scope: PatchScope,
        entity_id: i64,
    ) -> Result<Option<ConfigurationPatch>> {
        let row = sqlx::query(
            r#"
            SELECT patch_id, strategy_id, scope, entity_id, content
            FROM configuration_patches
            WHERE strategy_id = $1 AND scope = $2 AND entity_id = $3
            "#,
        )
        .bind(strategy_id)
        .bind(scope.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let scope: String = row.try_get("scope")?;
        Ok(Some(ConfigurationPatch {
            patch_id: row.try_get("patch_id")?,
            strategy_id: row.try_get("strategy_id")?,
            scope: PatchScope::try_from(scope.as_str()).map_err(|e| corrupt("patch scope", e))?,
            entity_id: row.try_get("entity_id")?,
            content: row.try_get("content")?,
        }))
    }
}
