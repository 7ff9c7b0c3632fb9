//! Custom error types for trace acquisition.
//!
//! This module defines `AcqError`, the single error type shared by the block
//! decoder, the scaling engine, the transports and both acquisition
//! controllers. It is built with `thiserror` so every layer can propagate with
//! `?` while the controllers still match on individual kinds.
//!
//! ## Error Kinds
//!
//! - **Connection**: `ConnectionFailure` is raised when a transport cannot be
//!   opened or the instrument does not answer `*IDN?`. It aborts before any
//!   acquisition starts.
//! - **Configuration**: `ConfigurationRejected` marks a parameter the
//!   controller refused to send (e.g. an out-of-range point count). The
//!   spectrum controller logs it and keeps the instrument's current setting.
//! - **Read-back**: `FrequencyQueryFailed` is fatal; `PointCountQueryFailed`
//!   degrades to a default point count.
//! - **Trigger**: `TriggerTimeout` ends the current oscilloscope capture and
//!   the rest of its batch, while already captured traces are kept.
//! - **Decode**: `EmptyPayload`, `MalformedBlock`, `LengthMismatch` and
//!   `NumericParseError` come from the block decoder and the preamble parser.
//! - **Scaling**: `InvalidPointCount` comes from axis generation.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Errors raised while talking to an instrument or decoding its data.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Transport could not be opened or the instrument did not identify.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// A requested setting was refused and the current instrument value kept.
    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(String),

    /// Neither start/stop nor center/span could be read back.
    #[error("Frequency query failed: {0}")]
    FrequencyQueryFailed(String),

    /// Sweep point count could not be read back.
    #[error("Point count query failed: {0}")]
    PointCountQueryFailed(String),

    /// The acquisition never reported a stopped state within the window.
    #[error("Trigger timeout after {waited:?}")]
    TriggerTimeout {
        /// Time spent polling before giving up.
        waited: Duration,
    },

    /// The response held no data after trimming.
    #[error("Empty payload")]
    EmptyPayload,

    /// The response did not follow the expected block layout.
    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    /// Declared and actual sizes disagree.
    #[error("Length mismatch: declared {declared}, found {actual}")]
    LengthMismatch {
        /// Size announced by the header or preamble.
        declared: usize,
        /// Size actually present.
        actual: usize,
    },

    /// A token in a numeric response could not be parsed.
    #[error("Failed to parse numeric token '{token}'")]
    NumericParseError {
        /// The offending token, trimmed.
        token: String,
    },

    /// An axis cannot be generated for this point count.
    #[error("Invalid point count: {0}")]
    InvalidPointCount(usize),

    /// The instrument answered with something the controller did not expect.
    #[error("Unexpected response to '{command}': {response}")]
    UnexpectedResponse {
        /// Command that was sent.
        command: String,
        /// Response that came back.
        response: String,
    },

    /// Transport-level failure that is not an I/O error (VISA status, closed session).
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error from the underlying socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisting or loading a trace archive failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl AcqError {
    /// Whether the error belongs to the decode/scale layer for a single capture.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            AcqError::EmptyPayload
                | AcqError::MalformedBlock(_)
                | AcqError::LengthMismatch { .. }
                | AcqError::NumericParseError { .. }
                | AcqError::InvalidPointCount(_)
        )
    }

    /// Whether the error means the link itself was never usable.
    ///
    /// Read timeouts and other I/O errors on an open session are not link
    /// failures; best-effort cleanup commands are still sent after them.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, AcqError::ConnectionFailure(_))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for AcqError {
    fn from(err: csv::Error) -> Self {
        AcqError::Storage(err.to_string())
    }
}
