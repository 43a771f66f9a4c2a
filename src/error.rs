//! Error types for persistent reservation operations

use crate::scsi::SenseData;
use thiserror::Error;

/// Persistent reservation errors
#[derive(Debug, Error)]
pub enum PrError {
    /// Service action code outside the PR IN / PR OUT tables
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Rejected locally before anything was sent to the device
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Truncated response: declared {declared} bytes, buffer holds {available}")]
    TruncatedResponse { declared: usize, available: usize },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Reservation conflict: {0}")]
    ReservationConflict(String),

    #[error("Reservation key {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Device busy (status 0x{0:02x})")]
    DeviceBusy(u8),

    /// Cached model violated the holder-is-registered invariant
    #[error("Inconsistent reservation state: {0}")]
    InconsistentState(String),

    #[error("Check condition: {0}")]
    CheckCondition(SenseData),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrError {
    /// True for statuses the device reports as transient
    ///
    /// The engine never retries on its own; callers use this to decide
    /// whether to back off and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, PrError::DeviceBusy(_))
    }
}

/// Result type for persistent reservation operations
pub type PrResult<T> = Result<T, PrError>;
