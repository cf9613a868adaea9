//! Transaction Manager for atomic multi-row updates
//!
//! Port allocation is the one operation that must touch several rows
//! atomically; sibling shutdown during a forced restart also runs here so the
//! returned id list matches what was actually updated.

use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument, warn};

use crate::error::{ManmanError, Result};

/// Transaction scope identifier for tracking and debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionScope {
    /// Batch reservation of a session's ports
    PortAllocation,
    /// Forced stop of every other session of an SGC
    SiblingStop,
}

impl std::fmt::Display for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortAllocation => write!(f, "port_allocation"),
            Self::SiblingStop => write!(f, "sibling_stop"),
        }
    }
}

/// Transaction Manager for atomic database operations
#[derive(Clone)]
pub struct TransactionManager {
    pool: PgPool,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Begin a new transaction with scope tracking
    #[instrument(skip(self))]
    pub async fn begin(&self, scope: TransactionScope) -> Result<ManagedTransaction> {
        let tx = self.pool.begin().await?;
        debug!("Started transaction for scope: {}", scope);
        Ok(ManagedTransaction {
            tx: Some(tx),
            scope,
            committed: false,
        })
    }
}

/// A managed transaction with automatic rollback on drop
pub struct ManagedTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    scope: TransactionScope,
    committed: bool,
}

impl ManagedTransaction {
    /// Connection to run queries on. Use as: `.execute(tx.executor()?).await`
    pub fn executor(&mut self) -> Result<&mut sqlx::PgConnection> {
        let scope = self.scope;
        let tx = self.tx.as_mut().ok_or_else(|| {
            ManmanError::Internal(format!("transaction for scope {} already consumed", scope))
        })?;
        Ok(&mut **tx)
    }

    /// Commit the transaction
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            self.committed = true;
            debug!("Committed transaction for scope: {}", self.scope);
        }
        Ok(())
    }

    /// Rollback the transaction explicitly
    pub async fn rollback(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!("Rolled back transaction for scope: {}", self.scope);
        }
        Ok(())
    }
}

impl Drop for ManagedTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() && !self.committed {
            // sqlx rolls the transaction back when it is dropped
            warn!(
                "Transaction for scope {} was dropped without commit - rolling back",
                self.scope
            );
        }
    }
}
