//! Custom error types for the crate.
//!
//! `DaqError` is the error returned by the transport layer and every driver's
//! inherent methods. Capability traits and measurement sequences work in
//! `anyhow::Result` and convert with `?`, so driver errors keep their
//! message and can still be downcast by callers that care about the variant.
//!
//! ## Error Hierarchy
//!
//! - **`Io`**: Wraps `std::io::Error` from serial, socket and USBTMC streams.
//! - **`Timeout`** / **`ConnectionClosed`**: The instrument did not answer, or
//!   the transport hung up while a response was expected.
//! - **`Parse`**: A response arrived but could not be understood (e.g. a
//!   malformed number in a `trac:data?` dump).
//! - **`InvalidParameter`**: A request was rejected before any command was
//!   sent, such as an NPLC outside the instrument's range.
//! - **`UnsupportedResource`** / **`FeatureNotEnabled`**: The resource string
//!   names a transport this build cannot open.
//! - **`Config`** / **`Configuration`**: Loading or validating configuration.
//! - **`Instrument`**: The instrument reported a failure.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Timed out after {timeout_ms} ms waiting for '{resource}'")]
    Timeout { resource: String, timeout_ms: u128 },

    #[error("Connection to '{0}' closed")]
    ConnectionClosed(String),

    #[error("Could not parse response '{response}': {reason}")]
    Parse { response: String, reason: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported resource string '{0}'")]
    UnsupportedResource(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DaqError {
    /// Build a `Parse` error from the offending response text.
    pub fn parse(response: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::Parse {
            response: response.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::Timeout { .. } | DaqError::Parse { .. })
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
