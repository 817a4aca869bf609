//! Structured error kinds shared across the gateway core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes the core surfaces to its callers.
///
/// Each kind is handed to a different owner: the parser counts validation
/// errors and resyncs, write operations bubble errors to the config
/// manager, the CAN publisher downgrades TX failures to an alarm event, and
/// the CVL controller never fails at all.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("buffer too small: need {needed} bytes, have {available}")]
    InvalidSize { needed: usize, available: usize },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("CRC mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    InvalidCrc { expected: u16, computed: u16 },

    #[error("invalid frame header: {0}")]
    InvalidHeader(&'static str),

    #[error("response missing register 0x{address:04x}")]
    MissingRegister { address: u16 },

    #[error("remote device rejected the request with code {0}")]
    RemoteNack(u8),

    #[error("unexpected opcode 0x{0:02x} in response")]
    UnexpectedOpcode(u8),

    #[error("hardware error: {0}")]
    HardwareError(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("persistence error: {0}")]
    PersistenceError(String),
}

impl Error {
    /// True for the subset of parse failures that increment a diagnostic
    /// counter and resync the framer, rather than propagating to a caller
    /// awaiting a specific register write.
    pub fn is_frame_validation_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCrc { .. }
                | Error::InvalidHeader(_)
                | Error::MissingRegister { .. }
                | Error::InvalidSize { .. }
        )
    }
}
