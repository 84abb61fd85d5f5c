//! Error types for meetup

use crate::EndpointId;

/// Invalid command line or environment configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Either -listen{0} or -connect{0} must be specified")]
    MissingMode(u8),

    #[error("-{flag} must be greater than zero")]
    ZeroTimeout { flag: &'static str },
}

/// Errors raised while setting up a connection supplier
#[derive(Debug, thiserror::Error)]
pub enum SupplyError {
    #[error("listen: {endpoint}: failed to bind {addr}: {source}")]
    Bind {
        endpoint: EndpointId,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a single copy direction of a pipe stopped with a failure
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("read timed out after {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

impl PipeError {
    /// True when the direction stopped because a deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipeError::ReadTimeout(_) | PipeError::WriteTimeout(_))
    }
}

/// Errors that stop the rendezvous loop
#[derive(Debug, thiserror::Error)]
pub enum PairError {
    #[error("connection supplier for {0} stopped")]
    SupplierGone(EndpointId),
}
