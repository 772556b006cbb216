use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::connection::{ReadStatus, StreamOps};
use crate::deadline::Deadline;
use crate::endpoint::socket_file_name;
use crate::error::{IpcError, Operation, Result};

/// Permission mode for the socket special file.
pub const SOCKET_MODE: u32 = 0o600;

/// Prefix of the private directory holding the socket file.
pub const SOCKET_DIR_PREFIX: &str = "daemonlink-";

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Pause between connect attempts while the listen backlog is full.
const BACKLOG_RETRY: Duration = Duration::from_millis(10);

/// A connected Unix domain stream socket.
#[derive(Debug)]
pub(crate) struct SocketStream {
    stream: UnixStream,
    write_shut: bool,
}

impl SocketStream {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            write_shut: false,
        }
    }
}

impl StreamOps for SocketStream {
    fn read_chunk(&mut self, buf: &mut [u8], budget: Option<Duration>) -> Result<ReadStatus> {
        self.stream
            .set_read_timeout(budget)
            .map_err(|err| IpcError::transport(Operation::Read, err))?;
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadStatus::End(0)),
            Ok(n) => Ok(ReadStatus::More(n)),
            // Let the caller recompute the remaining budget and retry.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(ReadStatus::More(0)),
            Err(err) => Err(map_io_error(Operation::Read, err, budget)),
        }
    }

    fn write_chunk(&mut self, data: &[u8], budget: Option<Duration>) -> Result<usize> {
        if self.write_shut {
            return Err(IpcError::Closed {
                op: Operation::Write,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.stream
            .set_write_timeout(budget)
            .map_err(|err| IpcError::transport(Operation::Write, err))?;
        loop {
            match self.stream.write(data) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(Operation::Write, err, budget)),
            }
        }
    }

    fn finish_write(&mut self) -> Result<()> {
        self.stream
            .shutdown(Shutdown::Write)
            .map_err(|err| IpcError::transport(Operation::Write, err))?;
        self.write_shut = true;
        debug!("shut down write half");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        // The descriptor itself closes when the stream is dropped right after.
        debug!("closing unix stream");
        Ok(())
    }
}

fn map_io_error(op: Operation, err: io::Error, budget: Option<Duration>) -> IpcError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => IpcError::Timeout {
            op,
            timeout: budget.unwrap_or_default(),
        },
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
            IpcError::Aborted { op }
        }
        _ => IpcError::transport(op, err),
    }
}

fn map_connect_error(path: &Path, err: io::Error) -> IpcError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => IpcError::NotFound {
            path: path.to_path_buf(),
        },
        // The socket file exists but nothing is listening on it any more.
        Some(libc::ECONNREFUSED) => IpcError::Busy {
            path: path.to_path_buf(),
        },
        _ => IpcError::transport(Operation::Connect, err),
    }
}

/// Connect to the socket file at `path`, giving up once `deadline` passes.
pub(crate) fn connect(path: &Path, deadline: &Deadline) -> Result<SocketStream> {
    let (addr, addr_len) =
        socket_addr(path).map_err(|err| IpcError::transport(Operation::Connect, err))?;
    let stream = new_socket()
        .map(UnixStream::from)
        .map_err(|err| IpcError::transport(Operation::Connect, err))?;
    stream
        .set_nonblocking(true)
        .map_err(|err| IpcError::transport(Operation::Connect, err))?;

    loop {
        // SAFETY: `addr` is an initialized sockaddr_un and `addr_len` does not
        // exceed its size; the descriptor stays open for the call.
        let rc = unsafe {
            libc::connect(
                stream.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                addr_len,
            )
        };
        if rc == 0 {
            break;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EINTR) => {
                poll_ready(stream.as_raw_fd(), libc::POLLOUT, deadline, Operation::Connect)?;
                if let Some(err) = stream
                    .take_error()
                    .map_err(|err| IpcError::transport(Operation::Connect, err))?
                {
                    return Err(map_connect_error(path, err));
                }
                break;
            }
            // Listen backlog is full: the server is still busy with earlier peers.
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                let budget = deadline.remaining(Operation::Connect)?;
                debug!(?path, "listen backlog full, retrying connect");
                std::thread::sleep(budget.map_or(BACKLOG_RETRY, |left| left.min(BACKLOG_RETRY)));
            }
            _ => return Err(map_connect_error(path, err)),
        }
    }

    stream
        .set_nonblocking(false)
        .map_err(|err| IpcError::transport(Operation::Connect, err))?;
    debug!(?path, "connected to unix domain socket");
    Ok(SocketStream::new(stream))
}

fn new_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: `fd` is open for the duration of the call.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn socket_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path contains NUL",
        ));
    }

    // SAFETY: an all-zero sockaddr_un is a valid (empty) address.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "socket path too long ({} bytes, max {})",
                bytes.len(),
                addr.sun_path.len() - 1
            ),
        ));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// Wait until `fd` reports `events`, bounded by `deadline`.
fn poll_ready(fd: RawFd, events: libc::c_short, deadline: &Deadline, op: Operation) -> Result<()> {
    loop {
        let timeout_ms: libc::c_int = match deadline.remaining(op)? {
            None => -1,
            Some(left) => libc::c_int::try_from(left.as_nanos().div_ceil(1_000_000))
                .unwrap_or(libc::c_int::MAX),
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd entry for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(());
        }
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(IpcError::transport(op, err));
            }
        }
        // rc == 0: loop and let the deadline decide.
    }
}

/// Listening socket inside its own private temporary directory.
#[derive(Debug)]
pub(crate) struct SocketListener {
    listener: Option<UnixListener>,
    dir: Option<TempDir>,
    path: PathBuf,
}

impl SocketListener {
    /// Create a private directory and bind `{name}.sock` inside it.
    pub(crate) fn bind(name: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SOCKET_DIR_PREFIX)
            .tempdir()
            .map_err(|err| IpcError::transport(Operation::Bind, err))?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(|err| IpcError::transport(Operation::Bind, err))?;

        let path = dir.path().join(socket_file_name(name));
        let path_len = path.as_os_str().len();
        if path_len >= MAX_PATH_LEN {
            return Err(IpcError::InvalidName {
                name: name.to_string(),
                reason: format!("socket path too long ({path_len} bytes, max {MAX_PATH_LEN})"),
            });
        }

        let listener =
            UnixListener::bind(&path).map_err(|err| IpcError::transport(Operation::Bind, err))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|err| IpcError::transport(Operation::Bind, err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| IpcError::transport(Operation::Bind, err))?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener: Some(listener),
            dir: Some(dir),
            path,
        })
    }

    /// Accept one peer, bounded by `deadline`.
    pub(crate) fn accept(&self, deadline: &Deadline) -> Result<SocketStream> {
        let listener = self.listener.as_ref().ok_or(IpcError::Closed {
            op: Operation::Accept,
        })?;
        loop {
            poll_ready(listener.as_raw_fd(), libc::POLLIN, deadline, Operation::Accept)?;
            match listener.accept() {
                Ok((stream, _addr)) => {
                    // Some platforms let accepted sockets inherit O_NONBLOCK.
                    stream
                        .set_nonblocking(false)
                        .map_err(|err| IpcError::transport(Operation::Accept, err))?;
                    debug!("accepted connection");
                    return Ok(SocketStream::new(stream));
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(IpcError::transport(Operation::Accept, err)),
            }
        }
    }

    /// Close the listening socket but keep the socket file and its directory.
    ///
    /// Later connects are refused and reported as [`IpcError::Busy`];
    /// pending backlog connections are reset.
    pub(crate) fn stop_listening(&mut self) {
        if self.listener.take().is_some() {
            debug!(path = ?self.path, "stopped listening");
        }
    }

    /// Close the listening socket and remove the private directory.
    pub(crate) fn cleanup(&mut self) -> Result<()> {
        drop(self.listener.take());
        match self.dir.take() {
            Some(dir) => {
                dir.close()
                    .map_err(|err| IpcError::transport(Operation::Cleanup, err))?;
                info!(path = ?self.path, "removed socket directory");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub(crate) fn is_cleaned_up(&self) -> bool {
        self.dir.is_none()
    }

    /// The socket file path clients connect to.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use super::*;

    #[test]
    fn bind_creates_private_directory_and_socket() {
        let mut listener = SocketListener::bind("perm").unwrap();
        let path = listener.path().to_path_buf();

        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, SOCKET_MODE);

        let dir = path.parent().unwrap().to_path_buf();
        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(path.file_name().unwrap(), "perm.sock");

        listener.cleanup().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn concurrent_listeners_with_same_name_get_distinct_paths() {
        let mut a = SocketListener::bind("same").unwrap();
        let mut b = SocketListener::bind("same").unwrap();
        assert_ne!(a.path(), b.path());
        a.cleanup().unwrap();
        b.cleanup().unwrap();
    }

    #[test]
    fn connect_to_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let err = connect(&path, &Deadline::after(Some(Duration::from_secs(1)))).unwrap_err();
        assert!(matches!(err, IpcError::NotFound { .. }));
    }

    #[test]
    fn accept_times_out_without_peer() {
        let mut listener = SocketListener::bind("idle").unwrap();
        let started = std::time::Instant::now();
        let err = listener
            .accept(&Deadline::after(Some(Duration::from_millis(100))))
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::Timeout {
                op: Operation::Accept,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        listener.cleanup().unwrap();
    }

    #[test]
    fn half_close_ends_peer_read() {
        let mut listener = SocketListener::bind("half").unwrap();
        let path = listener.path().to_path_buf();

        let client = std::thread::spawn(move || {
            let mut stream = connect(&path, &Deadline::forever()).unwrap();
            stream.write_chunk(b"abc", None).unwrap();
            stream.finish_write().unwrap();
            let err = stream.write_chunk(b"more", None).unwrap_err();
            assert!(matches!(err, IpcError::Closed { .. }));
        });

        let mut server = listener.accept(&Deadline::forever()).unwrap();
        let mut buf = [0u8; 8];
        let mut got = Vec::new();
        loop {
            match server.read_chunk(&mut buf, None).unwrap() {
                ReadStatus::More(n) => got.extend_from_slice(&buf[..n]),
                ReadStatus::End(n) => {
                    got.extend_from_slice(&buf[..n]);
                    break;
                }
            }
        }
        assert_eq!(got, b"abc");

        client.join().unwrap();
        listener.cleanup().unwrap();
    }

    #[test]
    fn socket_addr_rejects_oversized_path() {
        let long = PathBuf::from(format!("/tmp/{}.sock", "a".repeat(200)));
        let err = socket_addr(&long).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn stopped_listener_refuses_clients_as_busy() {
        let mut listener = SocketListener::bind("stopped").unwrap();
        listener.stop_listening();
        assert!(!listener.is_cleaned_up());
        assert!(listener.path().exists());

        let err = connect(
            listener.path(),
            &Deadline::after(Some(Duration::from_secs(1))),
        )
        .unwrap_err();
        assert!(matches!(err, IpcError::Busy { .. }), "unexpected error: {err}");

        listener.cleanup().unwrap();
        assert!(!listener.path().exists());
    }

    #[test]
    fn reset_and_abort_map_to_aborted() {
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::ConnectionAborted] {
            let err = map_io_error(Operation::Read, io::Error::from(kind), None);
            assert!(matches!(err, IpcError::Aborted { op: Operation::Read }));
        }
        let err = map_io_error(Operation::Write, io::Error::from(io::ErrorKind::BrokenPipe), None);
        assert!(matches!(err, IpcError::Transport { .. }));
    }

    #[test]
    fn cleanup_twice_is_a_no_op() {
        let mut listener = SocketListener::bind("twice").unwrap();
        listener.cleanup().unwrap();
        assert!(listener.is_cleaned_up());
        listener.cleanup().unwrap();
        let err = listener.accept(&Deadline::forever()).unwrap_err();
        assert!(matches!(err, IpcError::Closed { .. }));
    }
}
