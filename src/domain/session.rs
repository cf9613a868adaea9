use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Record created, start command not yet acknowledged by the host
    Pending,
    /// Host agent is pulling the image / creating the container
    Starting,
    /// Game server process is up
    Running,
    /// Stop requested
    Stopping,
    /// Stopped on request
    Stopped,
    /// Process exited abnormally, or could not be provisioned
    Crashed,
    /// Host agent stopped reporting
    Lost,
    /// Process exited normally on its own
    Completed,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 8] = [
        SessionStatus::Pending,
        SessionStatus::Starting,
        SessionStatus::Running,
        SessionStatus::Stopping,
        SessionStatus::Stopped,
        SessionStatus::Crashed,
        SessionStatus::Lost,
        SessionStatus::Completed,
    ];

    /// Statuses that count as an existing session for conflict checks
    pub const LIVE: [SessionStatus; 6] = [
        SessionStatus::Pending,
        SessionStatus::Starting,
        SessionStatus::Running,
        SessionStatus::Stopping,
        SessionStatus::Crashed,
        SessionStatus::Lost,
    ];

    /// Statuses whose port reservations are stale
    pub const TERMINAL: [SessionStatus; 4] = [
        SessionStatus::Stopped,
        SessionStatus::Crashed,
        SessionStatus::Lost,
        SessionStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Lost => "lost",
            SessionStatus::Completed => "completed",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;

        match (self, target) {
            (Pending, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped | Completed) => true,

            // Stop may be requested before the host reports running
            (Pending | Starting, Stopping) => true,

            // Process exited by itself
            (Running, Completed) => true,

            // Agent-reported crash or heartbeat timeout
            (Pending | Starting | Running | Stopping, Crashed | Lost) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<SessionStatus> {
        use SessionStatus::*;

        match self {
            Pending => vec![Starting, Stopping, Crashed, Lost],
            Starting => vec![Running, Stopping, Crashed, Lost],
            Running => vec![Stopping, Completed, Crashed, Lost],
            Stopping => vec![Stopped, Completed, Crashed, Lost],
            Stopped | Crashed | Lost | Completed => vec![],
        }
    }

    /// Pending through Stopping
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending
                | SessionStatus::Starting
                | SessionStatus::Running
                | SessionStatus::Stopping
        )
    }

    /// Counts as existing for conflict checks. Crashed and Lost sessions exist
    /// but do not block a new start on their own.
    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    /// Does a session in this state make a non-forced start fail?
    pub fn blocks_new_start(&self) -> bool {
        self.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SessionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            "crashed" => Ok(SessionStatus::Crashed),
            "lost" => Ok(SessionStatus::Lost),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Free-form session parameters (key -> value)
pub type SessionParameters = BTreeMap<String, String>;

/// One execution attempt of a ServerGameConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub sgc_id: i64,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub parameters: SessionParameters,
    /// Backup to restore before the game server starts
    pub restore_backup_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a session row
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub sgc_id: i64,
    pub parameters: SessionParameters,
    pub restore_backup_id: Option<i64>,
}
