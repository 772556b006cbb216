use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;

use tracing::{debug, info};
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING, ERROR_MORE_DATA,
    ERROR_NO_DATA, ERROR_OPERATION_ABORTED, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED,
    ERROR_PIPE_NOT_CONNECTED, ERROR_SEM_TIMEOUT, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE,
    FILE_FLAG_OVERLAPPED, OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, SetNamedPipeHandleState,
    WaitNamedPipeW, NMPWAIT_WAIT_FOREVER, PIPE_READMODE_MESSAGE, PIPE_REJECT_REMOTE_CLIENTS,
    PIPE_TYPE_MESSAGE, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use crate::connection::{ReadStatus, StreamOps};
use crate::deadline::Deadline;
use crate::endpoint::{pipe_path, unique_suffix};
use crate::error::{IpcError, Operation, Result};

/// In/out buffer size of each pipe instance.
pub const BUFFER_SIZE: u32 = 1 << 16;

/// How an overlapped operation finished.
#[derive(Debug)]
enum Completion {
    /// Completed; `n` bytes transferred.
    Done(u32),
    /// A message read filled the buffer and the message continues.
    MoreData(u32),
    /// Failed with this Win32 error code.
    Failed(u32),
}

/// One OVERLAPPED structure with its manual-reset event.
///
/// If the operation is still in flight when this is dropped, it is canceled
/// and waited for, so the kernel never writes into freed memory.
struct Overlapped {
    raw: Box<OVERLAPPED>,
    _event: OwnedHandle,
    file: HANDLE,
    pending: bool,
}

impl Overlapped {
    fn new(file: HANDLE) -> io::Result<Self> {
        // SAFETY: default security, manual reset, initially unsignaled, unnamed.
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `event` is a fresh handle that nothing else owns.
        let event = unsafe { OwnedHandle::from_raw_handle(event) };
        // SAFETY: all-zero is the documented initial state of an OVERLAPPED.
        let mut raw: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
        raw.hEvent = event.as_raw_handle();
        Ok(Self {
            raw,
            _event: event,
            file,
            pending: false,
        })
    }

    fn as_mut_ptr(&mut self) -> *mut OVERLAPPED {
        &mut *self.raw
    }

    fn event(&self) -> HANDLE {
        self.raw.hEvent
    }

    fn result(&mut self) -> Completion {
        let mut transferred: u32 = 0;
        // SAFETY: the OVERLAPPED belongs to an operation issued on `self.file`.
        let ok = unsafe { GetOverlappedResult(self.file, &mut *self.raw, &mut transferred, 1) };
        self.pending = false;
        if ok != 0 {
            return Completion::Done(transferred);
        }
        // SAFETY: reads the calling thread's last-error value.
        match unsafe { GetLastError() } {
            ERROR_MORE_DATA => Completion::MoreData(transferred),
            code => Completion::Failed(code),
        }
    }

    fn cancel(&mut self) {
        if !self.pending {
            return;
        }
        // SAFETY: cancels only the operation tied to this OVERLAPPED.
        unsafe { CancelIoEx(self.file, &mut *self.raw) };
        // Wait for the cancellation itself to complete.
        let _ = self.result();
        debug!("canceled pending overlapped operation");
    }
}

impl Drop for Overlapped {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn budget_millis(budget: Option<Duration>) -> u32 {
    match budget {
        None => INFINITE,
        Some(left) => u32::try_from(left.as_nanos().div_ceil(1_000_000))
            .unwrap_or(INFINITE - 1)
            .clamp(1, INFINITE - 1),
    }
}

/// Issue one overlapped operation on `file` and wait for it within `budget`.
///
/// `start` must pass the given OVERLAPPED pointer to exactly one Win32 call
/// and return that call's BOOL result.
fn run_overlapped<F>(
    file: HANDLE,
    op: Operation,
    budget: Option<Duration>,
    start: F,
) -> Result<Completion>
where
    F: FnOnce(*mut OVERLAPPED) -> i32,
{
    let mut ov = Overlapped::new(file).map_err(|err| IpcError::transport(op, err))?;
    if start(ov.as_mut_ptr()) == 0 {
        // SAFETY: reads the calling thread's last-error value.
        match unsafe { GetLastError() } {
            ERROR_IO_PENDING => {
                ov.pending = true;
                // SAFETY: the event handle stays open while `ov` lives.
                let waited = unsafe { WaitForSingleObject(ov.event(), budget_millis(budget)) };
                if waited != WAIT_OBJECT_0 {
                    let err = if waited == WAIT_TIMEOUT {
                        IpcError::Timeout {
                            op,
                            timeout: budget.unwrap_or_default(),
                        }
                    } else {
                        IpcError::transport(op, io::Error::last_os_error())
                    };
                    ov.cancel();
                    return Err(err);
                }
            }
            // Completed synchronously with a partial message.
            ERROR_MORE_DATA => {}
            code => return Ok(Completion::Failed(code)),
        }
    }
    Ok(ov.result())
}

fn map_win32_error(op: Operation, code: u32) -> IpcError {
    match code {
        ERROR_OPERATION_ABORTED => IpcError::Aborted { op },
        _ => IpcError::transport(op, io::Error::from_raw_os_error(code as i32)),
    }
}

fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Raw pipe handle owned by a [`PipeListener`].
#[derive(Debug)]
struct ListenerHandle(RawHandle);

// SAFETY: the listener owns the handle and outlives every session that uses it.
unsafe impl Send for ListenerHandle {}

#[derive(Debug)]
enum PipeHandle {
    /// Client end: the stream owns the handle and closes it.
    Owned(OwnedHandle),
    /// Server end: teardown flushes and disconnects; the listener keeps the instance.
    Listener(ListenerHandle),
}

/// A connected named pipe end in message mode with overlapped I/O.
#[derive(Debug)]
pub(crate) struct PipeStream {
    handle: PipeHandle,
}

impl PipeStream {
    fn raw(&self) -> HANDLE {
        match &self.handle {
            PipeHandle::Owned(handle) => handle.as_raw_handle(),
            PipeHandle::Listener(handle) => handle.0,
        }
    }
}

impl StreamOps for PipeStream {
    fn read_chunk(&mut self, buf: &mut [u8], budget: Option<Duration>) -> Result<ReadStatus> {
        let file = self.raw();
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let completion = run_overlapped(file, Operation::Read, budget, |ov| {
            // SAFETY: `buf` outlives the operation: `run_overlapped` waits for
            // completion or cancellation before returning.
            unsafe { ReadFile(file, buf.as_mut_ptr().cast(), len, ptr::null_mut(), ov) }
        })?;
        match completion {
            Completion::Done(n) => Ok(ReadStatus::End(n as usize)),
            Completion::MoreData(n) => Ok(ReadStatus::More(n as usize)),
            // The peer closed its end without sending anything further.
            Completion::Failed(ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED) => {
                Ok(ReadStatus::End(0))
            }
            Completion::Failed(code) => Err(map_win32_error(Operation::Read, code)),
        }
    }

    fn write_chunk(&mut self, data: &[u8], budget: Option<Duration>) -> Result<usize> {
        let file = self.raw();
        let len = u32::try_from(data.len()).map_err(|_| {
            IpcError::transport(
                Operation::Write,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "payload does not fit in one pipe message",
                ),
            )
        })?;
        let completion = run_overlapped(file, Operation::Write, budget, |ov| {
            // SAFETY: `data` outlives the operation, as for reads.
            unsafe { WriteFile(file, data.as_ptr().cast(), len, ptr::null_mut(), ov) }
        })?;
        match completion {
            Completion::Done(n) if n == len => Ok(data.len()),
            Completion::Done(n) | Completion::MoreData(n) => Err(IpcError::transport(
                Operation::Write,
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short pipe write: {n} of {len} bytes"),
                ),
            )),
            Completion::Failed(code) => Err(map_win32_error(Operation::Write, code)),
        }
    }

    fn finish_write(&mut self) -> Result<()> {
        // Each write is one message; the message boundary ends the peer's read.
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let file = match &self.handle {
            PipeHandle::Owned(_) => {
                debug!("closing pipe client handle");
                return Ok(());
            }
            PipeHandle::Listener(handle) => handle.0,
        };

        // Let the client finish reading the last write before disconnecting.
        // SAFETY: `file` is the listener's open pipe handle.
        let flushed = unsafe { FlushFileBuffers(file) } != 0;
        let flush_err = io::Error::last_os_error();
        // SAFETY: as above; disconnecting keeps the instance for reuse.
        let disconnected = unsafe { DisconnectNamedPipe(file) } != 0;
        let disconnect_err = io::Error::last_os_error();

        if !flushed {
            return Err(IpcError::transport(
                Operation::Teardown,
                io::Error::new(
                    flush_err.kind(),
                    format!(
                        "failed to flush named pipe buffer, maybe the client hung up? ({flush_err})"
                    ),
                ),
            ));
        }
        if !disconnected {
            return Err(IpcError::transport(Operation::Teardown, disconnect_err));
        }
        debug!("disconnected pipe client");
        Ok(())
    }
}

/// Connect to the pipe at `path`, waiting for a free instance until `deadline`.
pub(crate) fn connect(path: &Path, deadline: &Deadline) -> Result<PipeStream> {
    let wide = to_wide(path.as_os_str());
    let wait = deadline
        .remaining_millis(Operation::Connect)?
        .unwrap_or(NMPWAIT_WAIT_FOREVER);

    // SAFETY: `wide` is a NUL-terminated UTF-16 string.
    if unsafe { WaitNamedPipeW(wide.as_ptr(), wait) } == 0 {
        // SAFETY: reads the calling thread's last-error value.
        return Err(map_connect_error(path, unsafe { GetLastError() }, deadline));
    }

    // SAFETY: `wide` is NUL-terminated; no template handle, default security.
    let raw = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            ptr::null_mut(),
        )
    };
    if raw == INVALID_HANDLE_VALUE {
        // SAFETY: reads the calling thread's last-error value.
        return Err(map_connect_error(path, unsafe { GetLastError() }, deadline));
    }
    // SAFETY: `raw` is a valid handle we just opened.
    let handle = unsafe { OwnedHandle::from_raw_handle(raw) };

    let mut mode = PIPE_READMODE_MESSAGE;
    // SAFETY: `mode` is a valid pipe mode; the other settings stay unchanged.
    let ok = unsafe {
        SetNamedPipeHandleState(
            handle.as_raw_handle(),
            &mut mode,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(IpcError::transport(
            Operation::Connect,
            io::Error::last_os_error(),
        ));
    }

    debug!(?path, "connected to named pipe");
    Ok(PipeStream {
        handle: PipeHandle::Owned(handle),
    })
}

fn map_connect_error(path: &Path, code: u32, deadline: &Deadline) -> IpcError {
    match code {
        ERROR_FILE_NOT_FOUND => IpcError::NotFound {
            path: path.to_path_buf(),
        },
        ERROR_PIPE_BUSY => IpcError::Busy {
            path: path.to_path_buf(),
        },
        ERROR_SEM_TIMEOUT => deadline.expired(Operation::Connect),
        code => IpcError::transport(Operation::Connect, io::Error::from_raw_os_error(code as i32)),
    }
}

/// A single-instance named pipe waiting for clients.
#[derive(Debug)]
pub(crate) struct PipeListener {
    handle: Option<OwnedHandle>,
    path: PathBuf,
}

impl PipeListener {
    /// Create `\\.\pipe\{name}-{suffix}.pipe` as the first and only instance.
    pub(crate) fn bind(name: &str) -> Result<Self> {
        let path = PathBuf::from(pipe_path(name, &unique_suffix()));
        let wide = to_wide(path.as_os_str());

        // SAFETY: `wide` is NUL-terminated; default security descriptor.
        let raw = unsafe {
            CreateNamedPipeW(
                wide.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE | FILE_FLAG_OVERLAPPED,
                PIPE_READMODE_MESSAGE | PIPE_TYPE_MESSAGE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                1,
                BUFFER_SIZE,
                BUFFER_SIZE,
                NMPWAIT_WAIT_FOREVER,
                ptr::null(),
            )
        };
        if raw == INVALID_HANDLE_VALUE {
            return Err(IpcError::transport(
                Operation::Bind,
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: `raw` is a valid handle we just created.
        let handle = unsafe { OwnedHandle::from_raw_handle(raw) };

        info!(?path, "listening on named pipe");
        Ok(Self {
            handle: Some(handle),
            path,
        })
    }

    /// Wait for a client to connect to the pipe instance, bounded by `deadline`.
    pub(crate) fn accept(&self, deadline: &Deadline) -> Result<PipeStream> {
        let file = self
            .handle
            .as_ref()
            .ok_or(IpcError::Closed {
                op: Operation::Accept,
            })?
            .as_raw_handle();
        let budget = deadline.remaining(Operation::Accept)?;

        // SAFETY: `file` is the open pipe handle owned by this listener.
        let completion = run_overlapped(file, Operation::Accept, budget, |ov| unsafe {
            ConnectNamedPipe(file, ov)
        })
        .map_err(|err| {
            if err.is_timeout() {
                deadline.expired(Operation::Accept)
            } else {
                err
            }
        })?;

        match completion {
            // A client that connected (or even left) before we asked still counts.
            Completion::Done(_)
            | Completion::MoreData(_)
            | Completion::Failed(ERROR_PIPE_CONNECTED | ERROR_NO_DATA) => {
                debug!(path = ?self.path, "accepted pipe client");
                Ok(PipeStream {
                    handle: PipeHandle::Listener(ListenerHandle(file)),
                })
            }
            Completion::Failed(code) => Err(map_win32_error(Operation::Accept, code)),
        }
    }

    /// Stop taking new clients. The single instance is already refused to
    /// clients while disconnected and not listening, so nothing changes here.
    pub(crate) fn stop_listening(&mut self) {
        debug!(path = ?self.path, "no longer accepting pipe clients");
    }

    /// Close the pipe instance for good.
    pub(crate) fn cleanup(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            info!(path = ?self.path, "closed named pipe");
        }
        Ok(())
    }

    pub(crate) fn is_cleaned_up(&self) -> bool {
        self.handle.is_none()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
