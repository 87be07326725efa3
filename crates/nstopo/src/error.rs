//! Error types for topology and netlink operations.

use std::io;

/// Result type for nstopo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or querying the topology.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket or filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A subscription named an event kind outside the known vocabulary.
    #[error("unknown event kind '{name}' (expected <object>.<event>, e.g. namespace.connect)")]
    UnknownEventKind {
        /// The rejected kind string.
        name: String,
    },

    /// An endpoint identifier could not be parsed.
    #[error("invalid endpoint identifier: {0}")]
    InvalidEndpoint(String),

    /// Namespace not found.
    #[error("namespace not found: {name}")]
    NamespaceNotFound {
        /// The namespace name that was not found.
        name: String,
    },

    /// Device not found in a namespace.
    #[error("device {index} not found in namespace {namespace}")]
    DeviceNotFound {
        /// Namespace that was searched.
        namespace: String,
        /// Kernel interface index.
        index: u32,
    },

    /// The actor task behind a handle has already stopped.
    #[error("device actor {namespace}:{index} has stopped")]
    ActorGone {
        /// Namespace owning the actor.
        namespace: String,
        /// Kernel interface index.
        index: u32,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Create a kernel error from a (negative) errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Add operation context to a kernel error.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Check if this is a "not found" error, from the kernel or the model.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, 2 | 19) // ENOENT=2, ENODEV=19
            }
            Self::NamespaceNotFound { .. } | Self::DeviceNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a permission error.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, 1 | 13) // EPERM=1, EACCES=13
            }
            Self::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno() {
        let err = Error::from_errno(-19);
        assert_eq!(err.errno(), Some(19));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_with_context() {
        let err = Error::from_errno(-13).with_context("entering namespace blue");
        assert!(err.is_permission_denied());
        assert!(err.to_string().starts_with("entering namespace blue:"));
    }

    #[test]
    fn test_model_not_found() {
        let err = Error::DeviceNotFound {
            namespace: "ns1".into(),
            index: 7,
        };
        assert!(err.is_not_found());
        assert_eq!(err.errno(), None);
        assert_eq!(err.to_string(), "device 7 not found in namespace ns1");
    }

    #[test]
    fn test_unknown_event_kind_message() {
        let err = Error::UnknownEventKind {
            name: "bridge.explode".into(),
        };
        assert!(err.to_string().contains("bridge.explode"));
    }
}
