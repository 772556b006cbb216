use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::connection::Connection;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::sys;

/// Client-side settings.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Bound on connecting and on each later `read`/`write`. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The client end of one session.
///
/// Dereferences to the session's [`Connection`]. The handle is closed when
/// the client is dropped, including on early returns and unwinding.
#[derive(Debug)]
pub struct IpcClient {
    name: PathBuf,
    connection: Connection,
}

impl IpcClient {
    /// Connect to the endpoint a server published as its connection name.
    pub fn connect(name: impl AsRef<Path>, timeout: Option<Duration>) -> Result<Self> {
        Self::connect_with_config(name, &ClientConfig { timeout })
    }

    /// Connect with explicit configuration.
    pub fn connect_with_config(name: impl AsRef<Path>, config: &ClientConfig) -> Result<Self> {
        let name = name.as_ref();
        let deadline = Deadline::after(config.timeout);
        let stream = sys::connect(name, &deadline)?;
        debug!(?name, timeout = ?config.timeout, "client connected");
        Ok(Self {
            name: name.to_path_buf(),
            connection: Connection::new(stream, config.timeout),
        })
    }

    /// One request/response turn: write `request`, then read the full reply.
    pub fn request(&mut self, request: &[u8]) -> Result<Bytes> {
        self.connection.write(request)?;
        self.connection.read()
    }

    /// The endpoint this client connected to.
    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

impl Deref for IpcClient {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for IpcClient {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpcError;

    #[test]
    fn config_builder_sets_timeout() {
        let config = ClientConfig::default().with_timeout(Some(Duration::from_millis(300)));
        assert_eq!(config.timeout, Some(Duration::from_millis(300)));
        assert_eq!(ClientConfig::default().timeout, None);
    }

    #[cfg(unix)]
    #[test]
    fn connect_without_listener_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = IpcClient::connect(dir.path().join("nobody.sock"), Some(Duration::from_secs(2)))
            .unwrap_err();
        assert!(matches!(err, IpcError::NotFound { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
