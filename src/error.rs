use thiserror::Error;

use crate::agent::AgentState;
use crate::offer::OfferState;
use crate::types::{AgentId, OfferId};

/// Main error type for the trade-offer pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Uniqueness / binding errors
    #[error("Duplicate constraint in dimension '{dimension}': instance with unique values ({fields}) already exists")]
    DuplicateConstraint { dimension: String, fields: String },

    #[error("Agent {0} is already bound to a pool")]
    AlreadyBound(AgentId),

    #[error("Agent '{0}' has no identity, cannot bind it to a pool")]
    MissingIdentity(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent '{0}' is not bound to this pool")]
    NotBound(String),

    // Offer errors
    #[error("Offer {offer} is already resolved (state: {state})")]
    AlreadyResolved { offer: OfferId, state: OfferState },

    #[error("Offer {0} has already been sent")]
    AlreadySent(OfferId),

    #[error("Offer has not been sent yet")]
    OfferNotSent,

    #[error("Offer {0} is still active and cannot be removed")]
    OfferStillActive(OfferId),

    #[error("Offer belongs to agent '{owner}', not '{agent}'")]
    ForeignOffer { owner: String, agent: String },

    #[error("Items to send are owned by more than one agent: {0}")]
    MixedOwners(String),

    #[error("Offer has no items to send, cannot pick an owning agent")]
    NoItemsToSend,

    // Session errors
    #[error("Agent '{0}' is not ready or its session is closed")]
    NotReady(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Login error: {0}")]
    LoginError(String),

    #[error("Session error: {0}")]
    UnknownSessionError(String),

    #[error("Session of agent '{agent}' ended before ready (state: {state})")]
    SessionFailed { agent: String, state: AgentState },

    #[error("Agent '{agent}' not ready after {timeout_ms}ms")]
    ReadyTimeout { agent: String, timeout_ms: u64 },

    // Transport errors
    #[error("Invalid trade url: {0}")]
    InvalidTradeUrl(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Dispatch errors
    #[error("Handler for '{event}' panicked: {message}")]
    HandlerPanicked { event: String, message: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for PoolError
pub type Result<T> = std::result::Result<T, PoolError>;

/// Failures reported by a transport while establishing a session
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("login failed: {0}")]
    Login(String),

    #[error("connection failed: {0}")]
    Connection(String),
}

impl From<SessionError> for PoolError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidCredentials(msg) => PoolError::InvalidCredentials(msg),
            SessionError::Login(msg) => PoolError::LoginError(msg),
            SessionError::Connection(msg) => PoolError::UnknownSessionError(msg),
        }
    }
}

impl PoolError {
    /// Whether this error is an authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PoolError::InvalidCredentials(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_mapping() {
        let err: PoolError = SessionError::InvalidCredentials("bad password".into()).into();
        assert!(err.is_auth_failure());

        let err: PoolError = SessionError::Login("rate limited".into()).into();
        assert!(matches!(err, PoolError::LoginError(_)));
        assert!(!err.is_auth_failure());

        let err: PoolError = SessionError::Connection("no servers".into()).into();
        assert!(matches!(err, PoolError::UnknownSessionError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::AlreadyResolved {
            offer: OfferId(42),
            state: OfferState::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            "Offer 42 is already resolved (state: cancelled)"
        );
    }
}
