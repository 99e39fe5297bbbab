use chrono::{DateTime, Utc};
use ethereum_types::H256;
use std::time::Duration;

use super::dial_error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single dial, one row per attempt.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub node_id: H256,
    pub timestamp: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error: ErrorKind,
    /// Wall-clock duration of the full handshake sequence, successes only.
    pub latency: Option<Duration>,
    /// Whether this attempt pushed the node out of the active set.
    pub deprecable: bool,
}

impl ConnectionAttempt {
    pub fn succeeded(node_id: H256, latency: Duration) -> Self {
        Self {
            node_id,
            timestamp: Utc::now(),
            status: AttemptStatus::Succeeded,
            error: ErrorKind::None,
            latency: Some(latency),
            deprecable: false,
        }
    }

    pub fn failed(node_id: H256, error: ErrorKind) -> Self {
        Self {
            node_id,
            timestamp: Utc::now(),
            status: AttemptStatus::Failed,
            error,
            latency: None,
            deprecable: false,
        }
    }
}
