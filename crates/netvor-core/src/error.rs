//! Error types for the Netvor core

use std::io;

/// Result type alias for Netvor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the link parser, the profile store and the session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed share-link or missing required field
    #[error("invalid share link: {0}")]
    InvalidLink(String),

    /// Activate/start referencing a profile that does not exist
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    /// Binary provisioning failed
    #[error("binary unavailable: {0}")]
    BinaryUnavailable(String),

    /// The virtual interface could not be established
    #[error("failed to establish virtual interface: {0}")]
    TunEstablishFailed(String),

    /// A supervised subprocess could not be launched
    #[error("failed to launch {name}: {reason}")]
    SubprocessLaunchFailed { name: String, reason: String },

    /// Persistence read/write failure
    #[error("I/O failure: {0}")]
    IoFailure(#[from] io::Error),

    /// Settings file could not be parsed or failed validation
    #[error("settings error: {0}")]
    Settings(String),
}

impl Error {
    pub(crate) fn launch(name: &str, err: impl std::fmt::Display) -> Self {
        Error::SubprocessLaunchFailed {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }

    /// Errors caused by user input rather than by the environment
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::InvalidLink(_) | Error::ConfigNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::launch("xray", "permission denied");
        assert_eq!(err.to_string(), "failed to launch xray: permission denied");
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::IoFailure(_)));
        assert!(!err.is_user_error());
        assert!(Error::InvalidLink("x".into()).is_user_error());
    }
}
