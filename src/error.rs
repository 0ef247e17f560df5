//! Error types for the supervision core.

use thiserror::Error;

/// Errors raised by `ProcessHandle` and `Supervisor`.
///
/// None of these are fatal to the application: bulk operations turn them into
/// events and keep going.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{name} is already running")]
    AlreadyRunning { name: String },

    #[error("{name} is not running")]
    NotRunning { name: String },

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command for {0}")]
    EmptyCommand(String),

    #[error("invalid command for {name}: {reason}")]
    InvalidCommand { name: String, reason: String },

    #[error("no service with index {0}")]
    UnknownService(usize),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
