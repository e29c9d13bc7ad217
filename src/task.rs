//! Task identity and lifecycle states
//!
//! A task is minted at submission time as `Pending` and moves to exactly one
//! terminal state (`Success` or `Error`) when its solver finishes.

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::challenges::ChallengeKind;

/// Globally unique task identifier (UUID v4)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mint a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in the `error` state
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Attempt budget exhausted without a token
    NoTokenObserved(ChallengeKind),
    /// The backend (or the challenge provider behind it) explicitly refused
    BackendDenied,
    /// Still pending when the client polled past the deadline
    PendingTimeout,
    /// Unexpected backend fault
    BackendException { kind: ChallengeKind, detail: String },
}

impl FailureReason {
    /// Human readable detail, if any
    pub fn message(&self) -> Option<String> {
        match self {
            FailureReason::PendingTimeout => Some("Task timeout".to_string()),
            FailureReason::BackendException { detail, .. } => Some(detail.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoTokenObserved(kind) => write!(f, "{}_fail", kind.family()),
            FailureReason::BackendDenied => write!(f, "access_denied"),
            FailureReason::PendingTimeout => write!(f, "timeout"),
            FailureReason::BackendException { kind, .. } => write!(f, "{}_error", kind.family()),
        }
    }
}

/// State of a task in the result store
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending {
        label: String,
    },
    Success {
        value: String,
        elapsed: Duration,
        /// Kind-specific fields echoed back to the client (e.g. v3 action)
        extra: Map<String, Value>,
    },
    Error {
        reason: FailureReason,
        elapsed: Duration,
    },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending { .. })
    }
}

/// Seconds rounded to milliseconds, the precision reported to clients
pub fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}
