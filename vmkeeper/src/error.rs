use thiserror::Error;
use uuid::Uuid;

use vmkeeper_protocol::{MachineState, SessionState};

/// Errors surfaced by machine, session and storage operations.
///
/// Validation failures are returned before anything is mutated; failures in
/// the middle of a transaction are returned only after every touched cell
/// has been rolled back.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    ObjectInUse(String),

    #[error("{0}")]
    ObjectNotFound(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("machine {id} is inaccessible: {reason}")]
    Inaccessible { id: Uuid, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MachineError>;

impl MachineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn machine_state(what: &str, state: MachineState) -> Self {
        Self::InvalidState(format!("{} (machine state: {})", what, state))
    }

    pub fn session_state(what: &str, state: SessionState) -> Self {
        Self::InvalidState(format!("{} (session state: {})", what, state))
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::ObjectInUse(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl From<crate::cell::CellError> for MachineError {
    fn from(e: crate::cell::CellError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for MachineError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            Self::Internal("worker task panicked".to_string())
        } else {
            Self::Internal("worker task was cancelled".to_string())
        }
    }
}
