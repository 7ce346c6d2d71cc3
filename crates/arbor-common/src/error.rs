//! Unified error type for the arbor workspace.
//!
//! Every fallible operation in the daemon returns the same `Error` carrying a
//! kind from a closed enumeration, an optional errno, and a human-readable
//! text. RPC replies serialize the kind verbatim.

use std::fmt;
use std::io;

use thiserror::Error;

/// Closed enumeration of error kinds exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error. Present so RPC replies can carry a kind unconditionally.
    Success,
    /// Unclassified failure, typically a kernel write with an unexpected errno.
    Unknown,
    /// A value (name, property value, mask) failed validation.
    InvalidValue,
    /// The property tag itself is unknown or not applicable.
    InvalidProperty,
    /// The operation is not legal in the container's current state.
    InvalidState,
    /// The caller lacks permission for the operation.
    Permission,
    /// A lock or resource is held; try again later.
    Busy,
    /// The kernel or configuration does not support the request.
    NotSupported,
    /// The property has no value in this state.
    NoValue,
    /// A quota, id pool, CPU or memory reservation was exhausted.
    ResourceNotAvailable,
    /// The named container is not registered.
    ContainerDoesNotExist,
    /// A container with this name is already registered.
    ContainerAlreadyExists,
    /// The request was queued for asynchronous completion.
    Queued,
}

impl ErrorKind {
    /// Wire name of the kind, also used in persisted records and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Unknown => "Unknown",
            Self::InvalidValue => "InvalidValue",
            Self::InvalidProperty => "InvalidProperty",
            Self::InvalidState => "InvalidState",
            Self::Permission => "Permission",
            Self::Busy => "Busy",
            Self::NotSupported => "NotSupported",
            Self::NoValue => "NoValue",
            Self::ResourceNotAvailable => "ResourceNotAvailable",
            Self::ContainerDoesNotExist => "ContainerDoesNotExist",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
            Self::Queued => "Queued",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried through every layer of the daemon.
#[derive(Debug, Clone, Error)]
pub struct Error {
    /// Classification from the closed [`ErrorKind`] set.
    pub kind: ErrorKind,
    /// Kernel errno when the failure came from a syscall.
    pub errno: Option<i32>,
    /// Human-readable description.
    pub text: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{}: {} (errno {errno})", self.kind, self.text),
            None => write!(f, "{}: {}", self.kind, self.text),
        }
    }
}

impl Error {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            text: text.into(),
        }
    }

    /// Wraps a failed syscall, recording its errno.
    ///
    /// Unknown kernel errnos stay `Unknown`; the syscall name goes into the
    /// text so logs remain actionable.
    #[must_use]
    pub fn system(syscall: &str, err: &io::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: err.raw_os_error(),
            text: format!("{syscall}: {err}"),
        }
    }

    /// Attaches context in front of an existing error, keeping kind and errno.
    #[must_use]
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            errno: self.errno,
            text: format!("{ctx}: {}", self.text),
        }
    }

    /// Re-classifies the error while keeping errno and text.
    #[must_use]
    pub fn with_kind(self, kind: ErrorKind) -> Self {
        Self { kind, ..self }
    }

    /// True when the underlying errno matches.
    #[must_use]
    pub fn is_errno(&self, errno: i32) -> bool {
        self.errno == Some(errno)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: err.raw_os_error(),
            text: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidValue, err.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_text() {
        let err = Error::new(ErrorKind::InvalidValue, "bad name");
        let msg = format!("{err}");
        assert!(msg.contains("InvalidValue"));
        assert!(msg.contains("bad name"));
    }

    #[test]
    fn system_error_keeps_errno() {
        let io_err = io::Error::from_raw_os_error(libc_ebusy());
        let err = Error::system("write", &io_err);
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.is_errno(libc_ebusy()));
        assert!(err.text.starts_with("write:"));
    }

    #[test]
    fn context_preserves_kind() {
        let err = Error::new(ErrorKind::Busy, "container is busy")
            .context("stop a/b");
        assert_eq!(err.kind, ErrorKind::Busy);
        assert!(err.text.starts_with("stop a/b:"));
    }

    #[test]
    fn kind_names_round_trip_via_display() {
        assert_eq!(format!("{}", ErrorKind::ContainerDoesNotExist), "ContainerDoesNotExist");
        assert_eq!(format!("{}", ErrorKind::ResourceNotAvailable), "ResourceNotAvailable");
    }

    fn libc_ebusy() -> i32 {
        16
    }
}
