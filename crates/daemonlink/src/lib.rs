//! Request/response IPC between a short-lived client and a long-running daemon.
//!
//! daemonlink connects one client at a time to a server over a Unix domain
//! socket or a Windows named pipe. Each session is a single turn: the client
//! writes a request, the server reads it in full, replies, and ends the session.
//!
//! # Crate Structure
//!
//! - [`transport`] - Client, server and connection types for both platforms

/// Re-export transport types.
pub mod transport {
    pub use daemonlink_transport::*;
}

pub use daemonlink_transport::{
    AcceptPolicy, ClientConfig, Connection, ErrorKind, IpcClient, IpcError, IpcServer, Result,
    ServerConfig, ServerSession,
};
