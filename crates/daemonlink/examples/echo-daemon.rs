//! Minimal daemon: binds an endpoint, echoes each request back, stops after three sessions.
//!
//! Run with:
//!   cargo run --example echo-daemon
//!
//! In another terminal, using the printed connection name:
//!   cargo run --features cli -- send <connection-name> --data hello

use std::time::Duration;

use daemonlink::{IpcError, IpcServer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = IpcServer::bind("echo-daemon", Some(Duration::from_secs(60)))?;
    println!("{}", server.connection_name().display());

    for _ in 0..3 {
        let size = server.serve_one(|conn| -> Result<usize, IpcError> {
            let request = conn.read()?;
            conn.write(&request)?;
            Ok(request.len())
        })?;
        eprintln!("echoed {size} bytes");
    }

    server.cleanup()?;
    Ok(())
}
