//! Crate-wide error type.
//!
//! One flat enum, one variant per failure class. Every layer returns an
//! explicit error instead of a partially built result; teardown paths log
//! and continue rather than propagate.

use thiserror::Error;

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Unsupported or malformed VM configuration (duplicate console/serial,
    /// unsupported network type, mismatched queue sizes, missing kernel).
    #[error("unsupported configuration: {0}")]
    Config(String),

    /// A referenced host device does not exist on the host.
    #[error("host device not found: {0}")]
    DeviceMissing(String),

    /// Connect or protocol failure while talking to the VMM API.
    #[error("VMM API transport failure: {0}")]
    Transport(String),

    /// The VMM API answered with a non-success status.
    #[error("VMM API request to '{endpoint}' failed with HTTP status {status}")]
    HttpStatus { status: u16, endpoint: String },

    /// The VMM API returned a body that is not valid JSON.
    #[error("malformed VMM API response: {0}")]
    Parse(#[source] serde_json::Error),

    /// VMM process spawn failure or exhausted readiness probes.
    #[error("VMM process failure: {0}")]
    Process(String),

    /// Thread enumeration or affinity query failure.
    #[error("thread introspection failure: {0}")]
    Introspection(String),
}

impl MonitorError {
    /// True for errors raised by the transport layer (connect/protocol
    /// failures and non-success statuses alike).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MonitorError::Transport(_) | MonitorError::HttpStatus { .. }
        )
    }
}
