use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::deadline::Deadline;
use crate::endpoint::validate_logical_name;
use crate::error::{IpcError, Operation, Result};
use crate::sys;

/// Whether a listener serves one session or many.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// One accept cycle; later `accept` calls fail with [`IpcError::Closed`].
    ///
    /// The endpoint stops taking clients once the session is accepted, so
    /// late clients fail to connect instead of waiting on a dead backlog.
    Single,
    /// Any number of sequential accept cycles.
    #[default]
    Reusable,
}

/// Server-side settings.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Bound on `accept` and on each `read`/`write` of accepted sessions.
    /// It does not apply to binding. `None` waits forever.
    pub timeout: Option<Duration>,
    pub accept_policy: AcceptPolicy,
}

impl ServerConfig {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_accept_policy(mut self, policy: AcceptPolicy) -> Self {
        self.accept_policy = policy;
        self
    }
}

/// Listens on a uniquely named endpoint and serves one client at a time.
///
/// The listening resource lives until [`IpcServer::cleanup`] (or drop, as a
/// last resort). Each [`IpcServer::accept`] starts one session, which holds a
/// mutable borrow of the server until it ends.
pub struct IpcServer {
    name: String,
    listener: sys::Listener,
    config: ServerConfig,
    sessions: u64,
}

impl IpcServer {
    /// Bind a new endpoint for the logical `name`.
    pub fn bind(name: &str, timeout: Option<Duration>) -> Result<Self> {
        Self::bind_with_config(name, ServerConfig::default().with_timeout(timeout))
    }

    /// Bind with explicit configuration.
    pub fn bind_with_config(name: &str, config: ServerConfig) -> Result<Self> {
        validate_logical_name(name)?;
        let listener = sys::Listener::bind(name)?;
        info!(
            name,
            connection_name = ?listener.path(),
            policy = ?config.accept_policy,
            "server bound"
        );
        Ok(Self {
            name: name.to_string(),
            listener,
            config,
            sessions: 0,
        })
    }

    /// Block until one client connects and return its session.
    pub fn accept(&mut self) -> Result<ServerSession<'_>> {
        if self.listener.is_cleaned_up()
            || (self.config.accept_policy == AcceptPolicy::Single && self.sessions > 0)
        {
            return Err(IpcError::Closed {
                op: Operation::Accept,
            });
        }

        let deadline = Deadline::after(self.config.timeout);
        let stream = self.listener.accept(&deadline)?;
        self.sessions += 1;
        if self.config.accept_policy == AcceptPolicy::Single {
            self.listener.stop_listening();
        }
        debug!(session = self.sessions, "session started");

        Ok(ServerSession {
            connection: Connection::new(stream, self.config.timeout),
            _server: PhantomData,
        })
    }

    /// Run `handler` inside one accept cycle and tear the session down after.
    ///
    /// If both the handler and the teardown fail, the handler's error wins and
    /// the teardown failure is only logged.
    pub fn serve_one<T, E, F>(&mut self, handler: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, E>,
        E: From<IpcError>,
    {
        let mut session = self.accept()?;
        let outcome = handler(&mut session);
        let teardown = session.finish();
        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(teardown_err)) => {
                warn!(error = %teardown_err, "session teardown failed after handler error");
                Err(err)
            }
        }
    }

    /// Permanently release the listening resource.
    ///
    /// Removes the socket directory on Unix and closes the pipe on Windows.
    /// Calling it again is a no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        self.listener.cleanup()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.listener.is_cleaned_up()
    }

    /// Resolved endpoint address to publish to clients.
    pub fn connection_name(&self) -> &Path {
        self.listener.path()
    }

    /// The logical name this server was created from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of sessions accepted so far.
    pub fn sessions_accepted(&self) -> u64 {
        self.sessions
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.listener.is_cleaned_up() {
            return;
        }
        match self.listener.cleanup() {
            Ok(()) => debug!(name = %self.name, "cleaned up listener on drop"),
            Err(err) => warn!(name = %self.name, error = %err, "listener cleanup on drop failed"),
        }
    }
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer")
            .field("name", &self.name)
            .field("connection_name", &self.connection_name())
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish()
    }
}

/// One accepted session on an [`IpcServer`].
///
/// Dereferences to the session's [`Connection`]. Ending the session flushes
/// and disconnects the pipe instance on Windows, or closes the accepted
/// socket on Unix; the listener itself stays bound for the next accept.
pub struct ServerSession<'a> {
    connection: Connection,
    _server: PhantomData<&'a mut IpcServer>,
}

impl ServerSession<'_> {
    /// End the session and report any teardown failure.
    pub fn finish(mut self) -> Result<()> {
        self.connection.close()
    }
}

impl Deref for ServerSession<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for ServerSession<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

impl Drop for ServerSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.connection.close() {
            warn!(error = %err, "session teardown failed");
        }
    }
}

impl std::fmt::Debug for ServerSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::client::IpcClient;
    use crate::error::ErrorKind;

    #[test]
    fn bind_rejects_invalid_names() {
        let err = IpcServer::bind("no/slashes", None).unwrap_err();
        assert!(matches!(err, IpcError::InvalidName { .. }));
    }

    #[test]
    fn single_policy_refuses_second_accept() {
        let config = ServerConfig::default()
            .with_timeout(Some(Duration::from_secs(5)))
            .with_accept_policy(AcceptPolicy::Single);
        let mut server = IpcServer::bind_with_config("single", config).unwrap();
        let name = server.connection_name().to_path_buf();

        let client = thread::spawn(move || {
            let mut client = IpcClient::connect(&name, Some(Duration::from_secs(5))).unwrap();
            client.write(b"one").unwrap();
            client.read().unwrap()
        });

        server
            .serve_one(|conn| -> Result<()> {
                let request = conn.read()?;
                conn.write(&request)
            })
            .unwrap();
        assert_eq!(client.join().unwrap().as_ref(), b"one");

        let err = server.accept().unwrap_err();
        assert!(matches!(
            err,
            IpcError::Closed {
                op: Operation::Accept
            }
        ));
        assert_eq!(server.sessions_accepted(), 1);
        server.cleanup().unwrap();
    }

    #[test]
    fn single_policy_turns_late_clients_away() {
        let config = ServerConfig::default()
            .with_timeout(Some(Duration::from_secs(5)))
            .with_accept_policy(AcceptPolicy::Single);
        let mut server = IpcServer::bind_with_config("single-late", config).unwrap();
        let name = server.connection_name().to_path_buf();

        let first_name = name.clone();
        let client = thread::spawn(move || {
            let mut client =
                IpcClient::connect(&first_name, Some(Duration::from_secs(5))).unwrap();
            client.request(b"first").unwrap()
        });
        server
            .serve_one(|conn| -> Result<()> {
                let request = conn.read()?;
                conn.write(&request)
            })
            .unwrap();
        assert_eq!(client.join().unwrap().as_ref(), b"first");

        let started = std::time::Instant::now();
        let err = IpcClient::connect(&name, Some(Duration::from_millis(500))).unwrap_err();
        assert!(
            matches!(err.kind(), ErrorKind::Busy | ErrorKind::Timeout),
            "unexpected error: {err}"
        );
        #[cfg(unix)]
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(started.elapsed() < Duration::from_secs(3));

        server.cleanup().unwrap();
    }

    #[test]
    fn accept_after_cleanup_is_closed() {
        let mut server = IpcServer::bind("gone", None).unwrap();
        server.cleanup().unwrap();
        assert!(server.is_cleaned_up());
        assert!(matches!(
            server.accept().unwrap_err(),
            IpcError::Closed { .. }
        ));
    }

    #[test]
    fn handler_error_is_returned_over_teardown() {
        let mut server = IpcServer::bind("handler-error", Some(Duration::from_secs(5))).unwrap();
        let name = server.connection_name().to_path_buf();

        let client = thread::spawn(move || {
            let mut client = IpcClient::connect(&name, Some(Duration::from_secs(5))).unwrap();
            client.write(b"").unwrap();
        });

        let err = server
            .serve_one(|_conn| -> Result<()> { Err(IpcError::Aborted { op: Operation::Read }) })
            .unwrap_err();
        assert!(matches!(err, IpcError::Aborted { .. }));

        client.join().unwrap();
        server.cleanup().unwrap();
    }

    #[test]
    fn accept_honors_listener_timeout() {
        let mut server = IpcServer::bind("lonely", Some(Duration::from_millis(100))).unwrap();
        let started = std::time::Instant::now();
        let err = server.accept().unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
        server.cleanup().unwrap();
    }
}
