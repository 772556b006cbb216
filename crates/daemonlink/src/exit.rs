use std::fmt;
use std::io;

use daemonlink_transport::IpcError;

// Exit code constants shared by every subcommand.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn ipc_error(context: &str, err: IpcError) -> CliError {
    match err {
        IpcError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        IpcError::InvalidName { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        IpcError::Transport { ref source, .. }
            if source.kind() == io::ErrorKind::PermissionDenied =>
        {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        IpcError::NotFound { .. }
        | IpcError::Busy { .. }
        | IpcError::Aborted { .. }
        | IpcError::Closed { .. }
        | IpcError::Transport { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use daemonlink_transport::Operation;

    use super::*;

    #[test]
    fn timeouts_map_to_timeout_code() {
        let err = ipc_error(
            "connect failed",
            IpcError::Timeout {
                op: Operation::Connect,
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("connect failed: connect timed out"));
    }

    #[test]
    fn missing_endpoint_is_transport_error() {
        let err = ipc_error(
            "connect failed",
            IpcError::NotFound {
                path: PathBuf::from("/tmp/none.sock"),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn bad_name_is_usage_error() {
        let err = ipc_error(
            "bind failed",
            IpcError::InvalidName {
                name: "a/b".to_string(),
                reason: "contains a path separator".to_string(),
            },
        );
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn permission_denied_keeps_its_code() {
        let err = ipc_error(
            "bind failed",
            IpcError::Transport {
                op: Operation::Bind,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
        );
        assert_eq!(err.code, PERMISSION_DENIED);
    }
}
