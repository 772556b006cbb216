use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::error::{IpcError, Operation, Result};
use crate::sys::Stream as PlatformStream;

/// Chunk size used by [`Connection::read`].
pub const DEFAULT_READ_CHUNK: usize = 100_000;

/// Outcome of one primitive read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// `n` bytes were read and the peer may send more.
    More(usize),
    /// `n` bytes were read and the peer has nothing further to send.
    End(usize),
}

/// Primitive calls each platform variant provides.
///
/// The loops built on top of these live in this module; variants only map
/// one syscall (or one overlapped operation) each.
pub(crate) trait StreamOps {
    /// Read at most `buf.len()` bytes, waiting at most `budget` (`None` = forever).
    fn read_chunk(&mut self, buf: &mut [u8], budget: Option<Duration>) -> Result<ReadStatus>;

    /// Send a prefix of `data` and return how many bytes went out.
    ///
    /// Called at least once per write, including for empty `data`.
    fn write_chunk(&mut self, data: &[u8], budget: Option<Duration>) -> Result<usize>;

    /// Tell the peer no more data follows from this side.
    fn finish_write(&mut self) -> Result<()>;

    /// Release the OS resource behind the stream.
    fn release(&mut self) -> Result<()>;
}

/// Read until the peer signals the end of its data and return everything.
pub(crate) fn read_until_end<S: StreamOps>(
    stream: &mut S,
    max_chunk: usize,
    deadline: &Deadline,
) -> Result<Bytes> {
    if max_chunk == 0 {
        return Err(IpcError::transport(
            Operation::Read,
            io::Error::new(io::ErrorKind::InvalidInput, "read chunk size must be non-zero"),
        ));
    }

    let mut data = BytesMut::new();
    let mut chunk = vec![0u8; max_chunk];
    loop {
        let budget = deadline.remaining(Operation::Read)?;
        let status = stream
            .read_chunk(&mut chunk, budget)
            .map_err(|err| rebase_timeout(err, deadline, Operation::Read))?;
        match status {
            ReadStatus::More(n) => {
                trace!(bytes = n, "read chunk");
                data.extend_from_slice(&chunk[..n]);
            }
            ReadStatus::End(n) => {
                data.extend_from_slice(&chunk[..n]);
                break;
            }
        }
    }

    debug!(bytes = data.len(), "read complete");
    Ok(data.freeze())
}

/// Send all of `data`, then signal end-of-data to the peer.
pub(crate) fn write_all<S: StreamOps>(stream: &mut S, data: &[u8], deadline: &Deadline) -> Result<()> {
    let mut rest = data;
    loop {
        let budget = deadline.remaining(Operation::Write)?;
        let sent = stream
            .write_chunk(rest, budget)
            .map_err(|err| rebase_timeout(err, deadline, Operation::Write))?;
        rest = &rest[sent.min(rest.len())..];
        if rest.is_empty() {
            break;
        }
        if sent == 0 {
            return Err(IpcError::transport(
                Operation::Write,
                io::Error::new(io::ErrorKind::WriteZero, "peer accepted no bytes"),
            ));
        }
    }
    stream.finish_write()?;

    debug!(bytes = data.len(), "write complete");
    Ok(())
}

// Variants only know the budget of the chunk that timed out; report the
// operation's configured bound instead.
fn rebase_timeout(err: IpcError, deadline: &Deadline, op: Operation) -> IpcError {
    if err.is_timeout() {
        deadline.expired(op)
    } else {
        err
    }
}

/// A connected transport handle, shared by both ends of a session.
///
/// `read` collects everything the peer sends until it closes (or half-closes)
/// its side. `write` sends a complete payload and signals end-of-data. Both are
/// bounded by the configured timeout as a whole, not per chunk.
///
/// A `Connection` is not meant for concurrent use from several threads.
pub struct Connection {
    stream: Option<PlatformStream>,
    timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(stream: PlatformStream, timeout: Option<Duration>) -> Self {
        Self {
            stream: Some(stream),
            timeout,
        }
    }

    /// Read everything the peer writes, using [`DEFAULT_READ_CHUNK`].
    pub fn read(&mut self) -> Result<Bytes> {
        self.read_chunked(DEFAULT_READ_CHUNK)
    }

    /// Read everything the peer writes, `max_chunk` bytes per primitive read.
    pub fn read_chunked(&mut self, max_chunk: usize) -> Result<Bytes> {
        let deadline = Deadline::after(self.timeout);
        let stream = self
            .stream
            .as_mut()
            .ok_or(IpcError::Closed { op: Operation::Read })?;
        read_until_end(stream, max_chunk, &deadline)
    }

    /// Write all of `data` and signal end-of-data.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let deadline = Deadline::after(self.timeout);
        let stream = self
            .stream
            .as_mut()
            .ok_or(IpcError::Closed { op: Operation::Write })?;
        write_all(stream, data, &deadline)
    }

    /// Release the handle. Closing an already closed handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.release(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Bound applied to each subsequent `read` or `write` call.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(error = %err, "failed to release connection on drop");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("timeout", &self.timeout)
            .finish()
    }
}
