// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy for the PCK client

use crate::addr::LcnAddr;

/// All errors that can occur in the lcn-pck library.
#[derive(Debug, thiserror::Error)]
pub enum PckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Request timed out after all retries: {command}")]
    Timeout { command: String },

    #[error("Protocol violation: {details}")]
    ProtocolViolation { details: String },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("License error reported by gateway")]
    LicenseError,

    #[error("Command rejected by {addr} (code {code})")]
    Nack { addr: LcnAddr, code: u16 },

    #[error("Invalid address {addr}: {details}")]
    InvalidAddress { addr: LcnAddr, details: String },

    #[error("Invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl PckError {
    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PckError::Io(_)
                | PckError::ConnectionTimeout
                | PckError::ConnectionLost
                | PckError::ChannelClosed
        )
    }

    pub(crate) fn violation(details: impl Into<String>) -> Self {
        PckError::ProtocolViolation {
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PckError>;
