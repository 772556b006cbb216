use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// The transport step an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Bind,
    Connect,
    Accept,
    Read,
    Write,
    Close,
    /// Per-session teardown on the server side (flush + disconnect, or close).
    Teardown,
    /// Permanent release of the listening resource.
    Cleanup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Bind => "bind",
            Operation::Connect => "connect",
            Operation::Accept => "accept",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Close => "close",
            Operation::Teardown => "session teardown",
            Operation::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in IPC transport operations.
///
/// Platform error codes are translated into these variants at the boundary;
/// the original OS error is kept in [`IpcError::Transport`] for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The resolved endpoint does not exist.
    #[error("endpoint {path} not found")]
    NotFound { path: PathBuf },

    /// The endpoint exists but cannot take this client right now.
    #[error("endpoint {path} is busy")]
    Busy { path: PathBuf },

    /// The operation did not complete within its bound.
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: Operation, timeout: Duration },

    /// An in-flight operation was canceled by the peer or the OS.
    #[error("{op} was aborted")]
    Aborted { op: Operation },

    /// The handle or listener has already been released.
    #[error("{op} on a closed endpoint")]
    Closed { op: Operation },

    /// The logical endpoint name cannot be used.
    #[error("invalid endpoint name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Any other OS-level I/O failure.
    #[error("{op} failed: {source}")]
    Transport {
        op: Operation,
        #[source]
        source: io::Error,
    },
}

/// Coarse classification of an [`IpcError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Busy,
    Timeout,
    Aborted,
    Closed,
    InvalidName,
    TransportFailure,
}

impl IpcError {
    pub(crate) fn transport(op: Operation, source: io::Error) -> Self {
        Self::Transport { op, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IpcError::NotFound { .. } => ErrorKind::NotFound,
            IpcError::Busy { .. } => ErrorKind::Busy,
            IpcError::Timeout { .. } => ErrorKind::Timeout,
            IpcError::Aborted { .. } => ErrorKind::Aborted,
            IpcError::Closed { .. } => ErrorKind::Closed,
            IpcError::InvalidName { .. } => ErrorKind::InvalidName,
            IpcError::Transport { .. } => ErrorKind::TransportFailure,
        }
    }

    /// Whether this error means "no answer in time" rather than a broken transport.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout { .. })
    }

    /// The raw OS error code behind a transport failure, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IpcError::Transport { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
