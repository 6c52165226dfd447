//! AN-003: Error kinds surfaced by the store, the provisioner and the runner.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AncileError {
    #[error("group '{name}' already exists")]
    UniquenessViolation { name: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("no {kind} named '{name}'")]
    UnknownName { kind: &'static str, name: String },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("cannot provision environment for '{name}': {reason}")]
    ProvisioningFailure { name: String, reason: String },

    #[error("cannot spawn {}: {source}", .interpreter.display())]
    SpawnFailure {
        interpreter: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a run is already active")]
    RunActive,

    #[error("no document is open")]
    NoDocument,

    #[error("invalid background image {}: {reason}", .path.display())]
    InvalidImage { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AncileError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Text suitable for a modal or the output console.
    pub fn user_message(&self) -> String {
        match self {
            Self::UniquenessViolation { .. } => "A group with this name already exists.".to_string(),
            Self::NoDocument => "Unknown document title.".to_string(),
            Self::RunActive => "A process is already running. Stop it first.".to_string(),
            Self::ProvisioningFailure { name, reason } => {
                format!("Could not create the environment for '{}': {}", name, reason)
            }
            Self::SpawnFailure { interpreter, source } => {
                format!("Could not start {}: {}", interpreter.display(), source)
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AncileError>;
