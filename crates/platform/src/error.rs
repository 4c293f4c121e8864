//! Error types for Ironwire

use std::fmt;

/// Unified error type for all Ironwire operations
#[derive(Debug)]
pub enum IronwireError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, authorization, etc.)
    Security(String),

    /// Kernel IPsec engine error
    Kernel(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for IronwireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IronwireError::Io(e) => write!(f, "IO error: {}", e),
            IronwireError::Config(msg) => write!(f, "Configuration error: {}", msg),
            IronwireError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            IronwireError::Security(msg) => write!(f, "Security error: {}", msg),
            IronwireError::Kernel(msg) => write!(f, "Kernel error: {}", msg),
            IronwireError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            IronwireError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for IronwireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IronwireError::Io(e) => Some(e),
            IronwireError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IronwireError {
    fn from(err: std::io::Error) -> Self {
        IronwireError::Io(err)
    }
}

/// Result type for Ironwire operations
pub type IronwireResult<T> = Result<T, IronwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IronwireError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = IronwireError::Kernel("SPI allocation failed".to_string());
        assert_eq!(err.to_string(), "Kernel error: SPI allocation failed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IronwireError = io_err.into();
        assert!(matches!(err, IronwireError::Io(_)));
    }

    #[test]
    fn test_result_type() {
        fn example() -> IronwireResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
