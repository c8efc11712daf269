//! Error types for the media delivery stack.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context. The taxonomy follows the pipeline's propagation policy:
//!
//! - **Malformed packets** are *not* surfaced here: the codec marks the
//!   packet invalid and callers must check validity before use.
//! - **No data available** is an expected steady-state condition, encoded
//!   in return enums (see [`crate::buffer::AcquireResult`]), never as an
//!   error.
//! - **FEC precondition violations** (parity requested on an invalid
//!   packet) are hard errors: they indicate an upstream sequencing bug.
//! - Only initialization and full-pipeline failures propagate to the
//!   channel facade as user-visible errors. Timeouts and late frames are
//!   statistics.
//!
//! ```rust
//! use ndncast::RtcError;
//!
//! let error = RtcError::channel_start("video", "transport unavailable");
//! if error.is_retryable() {
//!     println!("worth retrying: {error}");
//! }
//! ```

use thiserror::Error;

/// Result type alias for media pipeline operations.
pub type Result<T, E = RtcError> = std::result::Result<T, E>;

/// Main error type for the media delivery stack.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RtcError {
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("FEC parity requested on invalid packet")]
    FecPrecondition,

    #[error("FEC encoding failed: {details}")]
    FecEncoding { details: String },

    #[error("Packet codec error in {context}: {details}")]
    Codec { context: String, details: String },

    #[error("Buffer operation failed: {context}")]
    Buffer { context: String, slot_index: Option<usize> },

    #[error("Failed to start {stage} worker: {reason}")]
    ChannelStart { stage: String, reason: String },

    #[error("Channel is shut down")]
    Shutdown,

    #[error("YAML configuration error")]
    ConfigFormat {
        #[source]
        source: serde_yaml_ng::Error,
    },
}

impl RtcError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RtcError::ChannelStart { .. } => true,
            RtcError::Buffer { .. } => true,
            RtcError::Config { .. } => false,
            RtcError::ConfigFormat { .. } => false,
            RtcError::FecPrecondition => false,
            RtcError::FecEncoding { .. } => false,
            RtcError::Codec { .. } => false,
            RtcError::Shutdown => false,
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        RtcError::Config { reason: reason.into() }
    }

    /// Helper constructor for codec errors with parse context.
    pub fn codec(context: impl Into<String>, details: impl Into<String>) -> Self {
        RtcError::Codec { context: context.into(), details: details.into() }
    }

    /// Helper constructor for buffer errors.
    pub fn buffer(context: impl Into<String>, slot_index: Option<usize>) -> Self {
        RtcError::Buffer { context: context.into(), slot_index }
    }

    /// Helper constructor for worker start failures.
    pub fn channel_start(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        RtcError::ChannelStart { stage: stage.into(), reason: reason.into() }
    }
}

impl From<serde_yaml_ng::Error> for RtcError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        RtcError::ConfigFormat { source: err }
    }
}
