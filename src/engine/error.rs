use ulid::Ulid;

use crate::model::{BookingStatus, ExtensionStatus};

#[derive(Debug)]
pub enum EngineError {
    Validation(&'static str),
    /// The booking's current status forbids the attempted operation.
    InvalidState {
        op: &'static str,
        status: BookingStatus,
    },
    NotFound(Ulid),
    UnknownNumber(String),
    ExtensionNotFound {
        booking: Ulid,
        index: usize,
    },
    ExtensionNotPending {
        index: usize,
        status: ExtensionStatus,
    },
    Conflict(Ulid),
    AlreadyExists(Ulid),
    NotRecurring(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::InvalidState { op, status } => {
                write!(f, "cannot {op} booking with status: {status}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownNumber(n) => write!(f, "unknown booking number: {n}"),
            EngineError::ExtensionNotFound { booking, index } => {
                write!(f, "booking {booking} has no extension at index {index}")
            }
            EngineError::ExtensionNotPending { index, status } => {
                write!(f, "cannot approve extension {index} with status: {status}")
            }
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotRecurring(id) => {
                write!(f, "booking {id} is not marked as recurring")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
