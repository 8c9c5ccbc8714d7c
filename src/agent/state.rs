use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::dispatch::EventKind;
use crate::error::PoolError;

/// Lifecycle state of an agent's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgentState {
    #[default]
    Stopped,
    /// Session launched, waiting for the ready event
    Waiting,
    Active,
    InvalidCredentials,
    UnknownError,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Waiting => "waiting",
            AgentState::Active => "active",
            AgentState::InvalidCredentials => "invalid_credentials",
            AgentState::UnknownError => "unknown_error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Active)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            AgentState::InvalidCredentials | AgentState::UnknownError
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error recorded by an agent or a pool
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    /// Event whose handler failed, if the error came from dispatch
    pub event: Option<EventKind>,
    pub error: Arc<PoolError>,
}

impl ErrorRecord {
    pub fn new(event: Option<EventKind>, error: Arc<PoolError>) -> Self {
        Self {
            at: Utc::now(),
            event,
            error,
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.event {
            Some(event) => write!(f, "[{}] {}: {}", self.at.to_rfc3339(), event, self.error),
            None => write!(f, "[{}] {}", self.at.to_rfc3339(), self.error),
        }
    }
}
