//! Request/response IPC transport between a short-lived client and a
//! long-running server process.
//!
//! One contract over two OS primitives:
//! - Unix domain stream sockets (Linux/macOS)
//! - Named pipes with overlapped I/O (Windows)
//!
//! A server binds a uniquely named endpoint from a logical name and publishes
//! [`IpcServer::connection_name`]. A client connects to that name, writes its
//! request (which signals end-of-data), and reads the reply until the server
//! ends its side. Payloads are opaque bytes; the transport adds no framing.
//!
//! ```no_run
//! use std::time::Duration;
//! use daemonlink_transport::{IpcClient, IpcServer};
//!
//! # fn main() -> daemonlink_transport::Result<()> {
//! let mut server = IpcServer::bind("example", Some(Duration::from_secs(5)))?;
//! let name = server.connection_name().to_path_buf();
//!
//! let client = std::thread::spawn(move || {
//!     let mut client = IpcClient::connect(&name, Some(Duration::from_secs(5)))?;
//!     client.request(b"ping")
//! });
//!
//! let mut session = server.accept()?;
//! let request = session.read()?;
//! session.write(&request)?;
//! session.finish()?;
//! # let _ = client.join();
//! server.cleanup()?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(any(unix, windows)))]
compile_error!("daemonlink-transport supports Unix and Windows targets only");

pub mod client;
pub mod connection;
mod deadline;
pub mod endpoint;
pub mod error;
pub mod server;

#[cfg(windows)]
pub mod pipe;
#[cfg(unix)]
pub mod uds;

#[cfg(unix)]
mod sys {
    pub(crate) use crate::uds::{connect, SocketListener as Listener, SocketStream as Stream};
}

#[cfg(windows)]
mod sys {
    pub(crate) use crate::pipe::{connect, PipeListener as Listener, PipeStream as Stream};
}

pub use client::{ClientConfig, IpcClient};
pub use connection::{Connection, DEFAULT_READ_CHUNK};
pub use error::{ErrorKind, IpcError, Operation, Result};
pub use server::{AcceptPolicy, IpcServer, ServerConfig, ServerSession};
