use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::services::SessionHandler;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<SessionHandler>,

    /// Cancelled on process shutdown; every request waits on a child of it
    pub shutdown: CancellationToken,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(handler: Arc<SessionHandler>, shutdown: CancellationToken) -> Self {
        Self {
            handler,
            shutdown,
            start_time: Utc::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }

    /// Token for one request's host agent round-trip
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
