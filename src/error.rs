//! # Error Types
//!
//! This module provides the error types used throughout the ts-relay
//! crate. It defines a central error type `RelayError` that encapsulates
//! every failure kind the splicer's error handling design distinguishes.
//!
//! ## Example Usage
//!
//! ```rust
//! use ts_relay::error::{Result, RelayError};
//!
//! fn check_sync_byte(b: u8) -> Result<()> {
//!     if b != 0x47 {
//!         return Err(RelayError::MalformedPacket("bad sync byte".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the ts-relay crate.
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O errors from pipe or socket operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A TS packet failed structural validation (bad sync byte, adaptation
    /// field length exceeding the packet body, truncated PSI section).
    /// Callers drop the packet and increment a counter; never fatal.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// PAT or PMT has not been observed on a source within a bounded
    /// window. The source remains non-ready; the controller will not
    /// splice to it.
    #[error("missing PSI: {0}")]
    MissingPSI(String),

    /// A rebased PTS/DTS/PCR value would go negative relative to its
    /// segment base. Callers clamp to the segment start and log.
    #[error("timestamp underflow: {0}")]
    TimestampUnderflow(String),

    /// The named pipe could not be opened or a read/write failed.
    /// Distinguishes direction so callers can apply the right recovery
    /// (reconnect-as-reader vs retry-as-writer).
    #[error("pipe unavailable ({direction}): {detail}")]
    PipeUnavailable {
        /// `"input"` or `"output"`.
        direction: &'static str,
        /// Human-readable detail for logging.
        detail: String,
    },

    /// A control-plane request was malformed: bad JSON, a missing key,
    /// a wrong type, or an invalid enum value. Maps to HTTP 400.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or failed validation at
    /// startup. This is the one error kind that is fatal.
    #[error("configuration error: {0}")]
    Config(String),
}

/// A specialized Result type for ts-relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
