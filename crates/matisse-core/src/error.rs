//! Error types for the Matisse controller.
//!
//! This module defines `MatisseError`, the single error type returned by the
//! instrument link and every control operation built on top of it. Using the
//! `thiserror` crate, each variant carries enough context to be shown to an
//! operator verbatim (including the instrument's own error code).
//!
//! ## Error Hierarchy
//!
//! - **`LinkUnavailable`**: the instrument could not be reached while
//!   constructing the controller. Fatal; no half-initialized controller exists.
//! - **`CommandRejected`**: the instrument answered with the `!ERROR` sentinel.
//!   Recoverable by the caller (e.g. retry with corrected parameters).
//! - **`Communication`** / **`MalformedResponse`**: transport failure or an
//!   unparseable response in the middle of an operation.
//! - **`ScanDivergence`** / **`ScanInProgress`** / **`ScanCancelled`**: coarse
//!   tuning failures.
//! - **`LockAttemptActive`**: a second lock attempt was requested while one
//!   already holds the control loops.
//! - **`Config`** / **`Configuration`**: configuration parsing and validation.
//!
//! A lock attempt that times out or saturates before locking is *not* an
//! error; those are reported as lock outcomes by the supervisor.
//!
//! Nothing in the controller retries automatically. Retry policy belongs to
//! the caller.

use crate::protocol::ScanKind;
use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type MatisseResult<T> = std::result::Result<T, MatisseError>;

/// Primary error type for the Matisse controller.
#[derive(Error, Debug)]
pub enum MatisseError {
    /// The instrument cannot be reached at startup.
    ///
    /// **Recovery Strategy**: check power and cabling, then construct a new
    /// controller. Never continue with a partially initialized one.
    #[error("Can't reach Matisse: {0}")]
    LinkUnavailable(String),

    /// The instrument responded with the error sentinel.
    ///
    /// `code` is the instrument's answer to `ERROR:CODE?`, kept verbatim.
    #[error("Error executing Matisse command '{command}': {code}")]
    CommandRejected {
        /// Command that was rejected
        command: String,
        /// Instrument error code response
        code: String,
    },

    /// Transport failure while exchanging a command.
    #[error("Communication failure on '{command}': {message}")]
    Communication {
        /// Command in flight when the transport failed
        command: String,
        /// Transport error description
        message: String,
    },

    /// A response could not be interpreted.
    #[error("Unexpected response to '{command}': '{response}'")]
    MalformedResponse {
        /// Command that produced the response
        command: String,
        /// Raw response text
        response: String,
    },

    /// A coarse scan could not converge within its bounded step budget.
    #[error("{scan} did not converge: {reason}")]
    ScanDivergence {
        /// Scan that failed
        scan: ScanKind,
        /// What prevented convergence
        reason: String,
    },

    /// A scan of the same kind is already running.
    #[error("A {0} is already running")]
    ScanInProgress(ScanKind),

    /// A scan was stopped before it finished. The motor is back at its
    /// start position.
    #[error("{0} was cancelled")]
    ScanCancelled(ScanKind),

    /// Lock acquisition was requested while another attempt is active.
    #[error("A lock attempt is already active")]
    LockAttemptActive,

    /// A caller supplied an out-of-range value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background operation panicked or was aborted.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl MatisseError {
    /// Build a communication error from a transport failure.
    pub fn communication(command: &str, err: impl std::fmt::Display) -> Self {
        MatisseError::Communication {
            command: command.to_string(),
            message: err.to_string(),
        }
    }

    /// Build a malformed-response error.
    pub fn malformed(command: &str, response: &str) -> Self {
        MatisseError::MalformedResponse {
            command: command.to_string(),
            response: response.to_string(),
        }
    }

    /// Whether the instrument itself rejected the command.
    pub fn is_rejection(&self) -> bool {
        matches!(self, MatisseError::CommandRejected { .. })
    }
}

impl From<figment::Error> for MatisseError {
    fn from(err: figment::Error) -> Self {
        MatisseError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MatisseError::CommandRejected {
            command: "MOTBI:WL 5000".to_string(),
            code: "ERROR:CODE 14".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Error executing Matisse command 'MOTBI:WL 5000': ERROR:CODE 14"
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn test_scan_divergence_names_scan() {
        let err = MatisseError::ScanDivergence {
            scan: ScanKind::ThinEtalon,
            reason: "reading unstable".into(),
        };
        assert!(err.to_string().starts_with("thin etalon scan did not converge"));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_link_unavailable_message() {
        let err = MatisseError::LinkUnavailable("port busy".into());
        assert!(err.to_string().contains("Can't reach Matisse"));
    }
}
