//! Error types shared by every genstream crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by an [`Engine`](crate::engine::Engine) implementation.
///
/// These never reach a consumer directly: the session worker converts them
/// into an `Error` step event.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// The engine stopped early because the step callback asked it to and it
    /// has no partial output to return.
    #[error("generation interrupted")]
    Interrupted,

    /// The device ran out of memory.
    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    /// A model, weight file or overlay could not be loaded.
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    /// Any other fault raised while stepping.
    #[error("engine fault: {0}")]
    Fault(String),
}

/// The error type for the generation-session orchestrator.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum GenerationError {
    /// Invalid catalog entry or generation parameter
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested program id is not in the catalog
    #[error("Unknown program: {program_id}")]
    UnknownProgram { program_id: String },

    /// A pipeline context or overlay could not be constructed
    #[error("Resource unavailable for {program_id}: {message}")]
    ResourceUnavailable { program_id: String, message: String },

    /// Fault raised by the engine while stepping
    #[error("Engine fault: {0}")]
    EngineFault(String),

    /// The session ended through cancellation rather than success or failure
    #[error("interrupted: {reason}")]
    Interrupted { reason: String },

    /// Internal invariant of the step-event channel was broken
    #[error("Channel protocol violation: {0}")]
    ChannelProtocolViolation(String),

    /// The owning connection is gone
    #[error("Connection closed: {connection_id}")]
    ConnectionClosed { connection_id: String },

    /// A context-mutating call was made without holding the context
    #[error("Pipeline context for {program_id} is not held by the caller")]
    ContextNotHeld { program_id: String },

    /// Session state machine misuse
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Malformed transport command
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// IO error (config files)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization { format: String, message: String },

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GenerationError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn unknown_program(program_id: impl Into<String>) -> Self {
        Self::UnknownProgram {
            program_id: program_id.into(),
        }
    }

    pub fn resource_unavailable(program_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            program_id: program_id.into(),
            message: message.into(),
        }
    }

    pub fn connection_closed(connection_id: impl ToString) -> Self {
        Self::ConnectionClosed {
            connection_id: connection_id.to_string(),
        }
    }

    pub fn interrupted(reason: impl ToString) -> Self {
        Self::Interrupted {
            reason: reason.to_string(),
        }
    }

    pub fn context_not_held(program_id: impl Into<String>) -> Self {
        Self::ContextNotHeld {
            program_id: program_id.into(),
        }
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// True for errors raised before any context was touched
    /// (unknown program, bad parameters, malformed command).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnknownProgram { .. } | Self::InvalidCommand(_)
        )
    }

    pub fn is_resource_unavailable(&self) -> bool {
        matches!(self, Self::ResourceUnavailable { .. })
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<EngineError> for GenerationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Interrupted => Self::Interrupted {
                reason: "engine stopped early".to_string(),
            },
            other => Self::EngineFault(other.to_string()),
        }
    }
}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for GenerationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for GenerationError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<minijinja::Error> for GenerationError {
    fn from(err: minijinja::Error) -> Self {
        Self::Configuration(format!("prompt template: {err}"))
    }
}

/// A type alias for `Result<T, GenerationError>`.
pub type Result<T> = std::result::Result<T, GenerationError>;
