//! Kernel pipe and splice(2) plumbing for zero-copy socket forwarding.
//!
//! A [`Pipe`] is a non-blocking kernel FIFO acting as the intermediate
//! buffer between two sockets. [`splice_to_pipe`] and [`splice_from_pipe`]
//! drain one side until the kernel reports `EAGAIN`, which is required
//! under edge-triggered readiness: a partial drain would stall the
//! connection until the peer produces another readiness edge.
//!
//! Linux-only: `splice(2)` and `F_SETPIPE_SZ` have no portable equivalent.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Bytes moved per splice(2) call.
pub const SPLICE_CHUNK: usize = 128 * 1024;

/// Target pipe buffer capacity (requires Linux 2.6.35+ to resize).
pub const PIPE_CAPACITY: usize = 1024 * 1024;

/// Outcome of draining a socket into a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceResult {
    /// Bytes were moved into the pipe.
    Transferred(u64),
    /// No data available right now (`EAGAIN`).
    Empty,
    /// The source reported end-of-stream.
    Eof,
}

/// A non-blocking kernel FIFO with a read end and a write end.
///
/// Both ends are `O_NONBLOCK | O_CLOEXEC`. The capacity is raised to
/// [`PIPE_CAPACITY`] on a best-effort basis; a kernel that refuses the
/// resize leaves the default capacity in place.
#[derive(Debug)]
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Create a pipe with the default [`PIPE_CAPACITY`] target.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(PIPE_CAPACITY)
    }

    /// Create a pipe, requesting `capacity` bytes of kernel buffer.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 returned two fresh descriptors we now own.
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        // Best-effort resize; failure is not fatal.
        unsafe {
            libc::fcntl(read.as_raw_fd(), libc::F_SETPIPE_SZ, capacity as libc::c_int);
            libc::fcntl(write.as_raw_fd(), libc::F_SETPIPE_SZ, capacity as libc::c_int);
        }

        Ok(Self { read, write })
    }

    /// Raw descriptor of the read end.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Raw descriptor of the write end.
    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Bytes currently buffered in the pipe (`FIONREAD` on the read end).
    ///
    /// Returns 0 if the query fails.
    pub fn bytes_queued(&self) -> usize {
        let mut bytes: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.read.as_raw_fd(), libc::FIONREAD, &mut bytes) };
        if rc < 0 { 0 } else { bytes.max(0) as usize }
    }
}

fn splice_once(from: RawFd, to: RawFd, len: usize) -> isize {
    unsafe {
        libc::splice(
            from,
            std::ptr::null_mut(),
            to,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    }
}

/// Drain `from` into the write end of `pipe` until `EAGAIN` or a short
/// transfer indicates the socket is empty (or the pipe is full).
pub fn splice_to_pipe(from: RawFd, pipe: &Pipe) -> io::Result<SpliceResult> {
    let mut total: u64 = 0;
    loop {
        let n = splice_once(from, pipe.write_fd(), SPLICE_CHUNK);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                break;
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(SpliceResult::Eof);
        }
        total += n as u64;
        if (n as usize) < SPLICE_CHUNK {
            break;
        }
    }
    if total > 0 {
        Ok(SpliceResult::Transferred(total))
    } else {
        Ok(SpliceResult::Empty)
    }
}

/// Drain the read end of `pipe` into `to` until `EAGAIN` or the pipe is
/// empty.
pub fn splice_from_pipe(pipe: &Pipe, to: RawFd) -> io::Result<()> {
    loop {
        let n = splice_once(pipe.read_fd(), to, SPLICE_CHUNK);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                break;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }
    }
    Ok(())
}
