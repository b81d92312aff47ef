//! Error types for the gate, its storage primitive and its configuration.

use thiserror::Error;

/// Errors returned by a [`WriteStorage`](crate::storage::WriteStorage) implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The storage refused the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Path is not usable by this storage
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// The errno a syscall-level caller would observe for this error.
    pub fn errno(&self) -> i32 {
        match self {
            StorageError::NotFound(_) => libc::ENOENT,
            StorageError::PermissionDenied(_) => libc::EACCES,
            StorageError::InvalidPath(_) => libc::EINVAL,
            StorageError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Caller-visible outcome of a rejected or failed gated write.
#[derive(Debug, Error)]
pub enum GateError {
    /// A record in the payload names an identity outside the whitelist.
    #[error("operation not permitted: {reason}")]
    Denied {
        /// The offending identity field, lossily decoded.
        identity: String,
        /// Why the policy denied it.
        reason: String,
    },
    /// The payload could not be copied in for inspection. Fails closed.
    #[error("operation not permitted: cannot buffer {requested} byte payload")]
    ResourceExhausted {
        /// Size of the payload that could not be buffered.
        requested: usize,
    },
    /// The storage primitive itself failed after the write was allowed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GateError {
    /// Returns true if the gate rejected the write (as opposed to storage failing).
    pub fn is_denied(&self) -> bool {
        matches!(
            self,
            GateError::Denied { .. } | GateError::ResourceExhausted { .. }
        )
    }

    /// The errno surfaced to the writer: `EPERM` for anything the gate rejected.
    pub fn errno(&self) -> i32 {
        match self {
            GateError::Denied { .. } | GateError::ResourceExhausted { .. } => libc::EPERM,
            GateError::Storage(e) => e.errno(),
        }
    }

    /// Convert into an [`std::io::Error`] carrying the errno.
    pub fn into_io_error(self) -> std::io::Error {
        match self {
            GateError::Storage(StorageError::Io(e)) => e,
            other => std::io::Error::from_raw_os_error(other.errno()),
        }
    }
}

/// Errors raised while loading or validating a [`GateConfig`](crate::config::GateConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The whitelist has no entries
    #[error("whitelist must contain at least one identity")]
    EmptyWhitelist,
    /// A whitelist entry is unusable as an identity field
    #[error("invalid whitelist identity {identity:?}: {reason}")]
    InvalidIdentity {
        /// The offending entry.
        identity: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// The monitored target is unusable
    #[error("invalid monitored target: {0}")]
    InvalidTarget(String),
    /// Record delimiters conflict
    #[error("line delimiter and field separator must differ")]
    AmbiguousFormat,
    /// IO error reading the config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The observability sink could not take an event.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink is gone or refusing events
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// Event could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// IO error writing the event
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`install`](crate::install::install).
#[derive(Debug, Error)]
pub enum InstallError {
    /// The gate is already installed in this process
    #[error("interception gate already installed")]
    AlreadyInstalled,
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_denials_surface_as_eperm() {
        let denied = GateError::Denied {
            identity: "mallory".to_string(),
            reason: "not whitelisted".to_string(),
        };
        assert!(denied.is_denied());
        assert_eq!(denied.errno(), libc::EPERM);

        let exhausted = GateError::ResourceExhausted { requested: 10 };
        assert!(exhausted.is_denied());
        assert_eq!(exhausted.errno(), libc::EPERM);
        assert_eq!(
            exhausted.into_io_error().kind(),
            std::io::ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_storage_errors_pass_through() {
        let err = GateError::from(StorageError::Io(std::io::Error::from_raw_os_error(
            libc::ENOSPC,
        )));
        assert!(!err.is_denied());
        assert_eq!(err.errno(), libc::ENOSPC);
        assert_eq!(err.into_io_error().raw_os_error(), Some(libc::ENOSPC));

        let err = GateError::from(StorageError::NotFound("/etc/passwd".to_string()));
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
