//! Error types for ICE negotiation

use thiserror::Error;

/// Result type for ICE negotiation operations
pub type Result<T> = std::result::Result<T, IceError>;

/// Failure reported by the underlying ICE engine.
///
/// `operation` names the engine call that failed and `code` carries the
/// engine's own status value, which is only meaningful to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ICE engine call '{operation}' failed with status {code}")]
pub struct EngineError {
    pub operation: &'static str,
    pub code: i32,
}

impl EngineError {
    pub fn new(operation: &'static str, code: i32) -> Self {
        Self { operation, code }
    }
}

/// Errors that can occur while negotiating a media path
#[derive(Debug, Error)]
pub enum IceError {
    /// An engine call failed; fatal to the current attempt
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Every resolved STUN/TURN address has been tried
    #[error("No STUN/TURN server left to try: {reason}")]
    ServerBusy { reason: String },

    /// The privacy guard rejected the remote media description
    #[error("Invalid media: {reason}")]
    InvalidMedia { reason: String },

    /// The API was used out of order
    #[error("Operation '{operation}' not valid in current state: {reason}")]
    ProtocolState { operation: String, reason: String },

    /// Hostname resolution failed
    #[error("Failed to resolve '{host}': {reason}")]
    DnsResolution { host: String, reason: String },

    /// A caller-supplied argument was unusable
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// No live session with this id
    #[error("ICE session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The engine has not been initialized, or was shut down
    #[error("ICE engine not running")]
    NotInitialized,

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl IceError {
    /// Create a server busy error
    pub fn server_busy(reason: impl Into<String>) -> Self {
        Self::ServerBusy { reason: reason.into() }
    }

    /// Create an invalid media error
    pub fn invalid_media(reason: impl Into<String>) -> Self {
        Self::InvalidMedia { reason: reason.into() }
    }

    /// Create a protocol state error
    pub fn protocol_state(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtocolState {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a DNS resolution error
    pub fn dns(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsResolution {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter { message: message.into() }
    }

    /// Create a session not found error
    pub fn session_not_found(session_id: impl ToString) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// True when the error came from the engine
    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine(_))
    }
}
