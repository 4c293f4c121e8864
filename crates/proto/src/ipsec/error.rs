//! Error types for IPsec protocol operations
//!
//! This module defines a unified error type for the IKEv2 control plane.

use std::fmt;

/// Result type for IPsec operations
pub type Result<T> = std::result::Result<T, Error>;

/// IPsec protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid IKEv2 message format
    InvalidMessage(String),

    /// Invalid IKEv2 payload
    InvalidPayload(String),

    /// No acceptable proposal found
    NoProposalChosen,

    /// No acceptable traffic selectors found
    TsUnacceptable,

    /// Key exchange method not supported or mismatched
    InvalidKeExchange(String),

    /// Malformed multi-key-exchange plan (gap or missing primary)
    MalformedKePlan(String),

    /// Security label mismatch or unusable label
    LabelMismatch(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// Kernel IPsec engine rejected an operation
    Kernel(String),

    /// Invalid packet length
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Invalid parameter supplied by caller
    InvalidParameter(String),

    /// State machine error
    InvalidState(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMessage(msg) => write!(f, "Invalid IKE message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid IKE payload: {}", msg),
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::TsUnacceptable => {
                write!(f, "No acceptable traffic selectors found")
            }
            Error::InvalidKeExchange(msg) => {
                write!(f, "Key exchange failed: {}", msg)
            }
            Error::MalformedKePlan(msg) => {
                write!(f, "Malformed key exchange plan: {}", msg)
            }
            Error::LabelMismatch(msg) => {
                write!(f, "Security label mismatch: {}", msg)
            }
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::Kernel(msg) => write!(f, "Kernel error: {}", msg),
            Error::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for ironwire_platform::IronwireError {
    fn from(err: Error) -> Self {
        ironwire_platform::IronwireError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid IKE message: test");

        let err = Error::InvalidLength {
            expected: 10,
            actual: 5,
        };
        assert_eq!(err.to_string(), "Invalid length: expected 10, got 5");

        let err = Error::TsUnacceptable;
        assert_eq!(err.to_string(), "No acceptable traffic selectors found");
    }

    #[test]
    fn test_error_clone() {
        let err1 = Error::NoProposalChosen;
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_platform_error_conversion() {
        let err: ironwire_platform::IronwireError = Error::NoProposalChosen.into();
        assert!(matches!(
            err,
            ironwire_platform::IronwireError::Protocol(_)
        ));
    }
}
