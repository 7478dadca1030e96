//! Connection record and forwarding state machine.
//!
//! A [`Conn`] pairs one client socket with one backend socket and two
//! kernel pipes, one per direction. After the accept path hands a record
//! to a worker it is owned exclusively by that worker until teardown;
//! dropping the record closes all six descriptors exactly once.

use splice_io::{Pipe, SpliceResult, splice_from_pipe, splice_to_pipe};
use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;

use crate::metrics;

/// Connection lifecycle state. Transitions out of `Connecting` are
/// one-way: to `Established` on socket-level readiness, or to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Established,
}

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client half-closed; the normal end of a session.
    ClientEof,
    /// Backend hung up unsolicited; abnormal, logged louder.
    BackendEof,
    /// Non-blocking connect to the backend failed.
    ConnectFailed,
    /// Hard splice or socket error.
    Error,
    /// Bound epoch no longer matches the published epoch.
    StaleEpoch,
    /// Process shutdown; in-flight connections are dropped, not drained.
    Shutdown,
}

/// One proxied client/backend pair.
#[derive(Debug)]
pub struct Conn {
    pub client: TcpStream,
    pub backend: TcpStream,
    /// Client -> backend FIFO.
    pub c2b: Pipe,
    /// Backend -> client FIFO.
    pub b2c: Pipe,
    /// Epoch sampled at accept; never changes afterwards.
    pub epoch: u64,
    pub state: ConnState,
    /// Whether the accept path incremented load and connection counters;
    /// gates the symmetric decrement at teardown.
    pub registered: bool,
}

impl Conn {
    /// Allocate a record with both pipes. A pipe creation failure drops
    /// the sockets and reports the error; no counters have moved yet.
    pub fn new(
        client: TcpStream,
        backend: TcpStream,
        state: ConnState,
        epoch: u64,
    ) -> io::Result<Self> {
        let c2b = Pipe::new()?;
        let b2c = Pipe::new()?;
        Ok(Self {
            client,
            backend,
            c2b,
            b2c,
            epoch,
            state,
            registered: false,
        })
    }

    /// Advance the state machine one step. Idempotent and event-driven:
    /// completes a pending backend connect, then drains both directions
    /// until the kernel reports no more progress.
    pub fn drive(&mut self) -> Result<(), CloseReason> {
        if self.state == ConnState::Connecting {
            match self.backend.take_error() {
                Ok(Some(_)) => return Err(CloseReason::ConnectFailed),
                Err(_) => return Err(CloseReason::Error),
                Ok(None) => match self.backend.peer_addr() {
                    Ok(_) => self.state = ConnState::Established,
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                    Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => return Ok(()),
                    Err(_) => return Err(CloseReason::ConnectFailed),
                },
            }
        }

        // Client -> backend.
        match pump(
            self.client.as_raw_fd(),
            &self.c2b,
            self.backend.as_raw_fd(),
            &metrics::BYTES_CLIENT_TO_BACKEND,
        ) {
            PumpEnd::Drained => {}
            PumpEnd::Eof => return Err(CloseReason::ClientEof),
            PumpEnd::Error => return Err(CloseReason::Error),
        }

        // Backend -> client.
        match pump(
            self.backend.as_raw_fd(),
            &self.b2c,
            self.client.as_raw_fd(),
            &metrics::BYTES_BACKEND_TO_CLIENT,
        ) {
            PumpEnd::Drained => {}
            PumpEnd::Eof => return Err(CloseReason::BackendEof),
            PumpEnd::Error => return Err(CloseReason::Error),
        }

        Ok(())
    }
}

enum PumpEnd {
    /// No more progress possible right now; readiness will drive the next
    /// step.
    Drained,
    /// The source socket reported end-of-stream.
    Eof,
    Error,
}

/// Move one direction forward: source socket into the pipe, pipe into the
/// destination socket, repeating while the pipe keeps emptying. Stopping
/// with residual bytes is fine: the re-arm marks the destination
/// write-ready and the next readiness edge resumes the drain. Stopping
/// only at EAGAIN is what keeps edge-triggered readiness from stalling.
fn pump(
    from: std::os::fd::RawFd,
    pipe: &Pipe,
    to: std::os::fd::RawFd,
    bytes_metric: &metriken::Counter,
) -> PumpEnd {
    loop {
        let moved = match splice_to_pipe(from, pipe) {
            Ok(result) => result,
            Err(_) => return PumpEnd::Error,
        };
        if splice_from_pipe(pipe, to).is_err() {
            return PumpEnd::Error;
        }
        match moved {
            SpliceResult::Eof => return PumpEnd::Eof,
            SpliceResult::Empty => return PumpEnd::Drained,
            SpliceResult::Transferred(n) => {
                bytes_metric.add(n);
                if pipe.bytes_queued() > 0 {
                    return PumpEnd::Drained;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    /// Build an established Conn plus the remote ends of both sockets.
    fn established_conn() -> (Conn, TcpStream, TcpStream) {
        let (client_remote, client_local) = tcp_pair();
        let (backend_local, backend_remote) = tcp_pair();
        client_local.set_nonblocking(true).unwrap();
        backend_local.set_nonblocking(true).unwrap();
        let conn = Conn::new(client_local, backend_local, ConnState::Established, 0).unwrap();
        (conn, client_remote, backend_remote)
    }

    #[test]
    fn forwards_client_bytes_to_backend() {
        let (mut conn, mut client, mut backend) = established_conn();

        client.write_all(b"\x01\x02\x03\x04").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        conn.drive().unwrap();

        backend
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut buf = [0u8; 8];
        let n = backend.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x01\x02\x03\x04");

        // And the reverse direction.
        backend.write_all(b"\x04\x03\x02\x01").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        conn.drive().unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x04\x03\x02\x01");
    }

    #[test]
    fn client_eof_is_reported() {
        let (mut conn, client, _backend) = established_conn();
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.drive(), Err(CloseReason::ClientEof));
    }

    #[test]
    fn backend_eof_is_distinct() {
        let (mut conn, _client, backend) = established_conn();
        drop(backend);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.drive(), Err(CloseReason::BackendEof));
    }

    #[test]
    fn drive_without_data_is_a_no_op() {
        let (mut conn, _client, _backend) = established_conn();
        conn.drive().unwrap();
        conn.drive().unwrap();
        assert_eq!(conn.state, ConnState::Established);
    }

    #[test]
    fn refused_connect_reports_failure() {
        // Grab a port that nothing is listening on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let (_client_remote, client_local) = tcp_pair();
        client_local.set_nonblocking(true).unwrap();

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let state = match socket.connect(&addr.into()) {
            Ok(()) => ConnState::Established,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                ConnState::Connecting
            }
            Err(_) => return, // refused synchronously; nothing left to test
        };

        let mut conn = Conn::new(client_local, socket.into(), state, 0).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut result = Ok(());
        for _ in 0..10 {
            result = conn.drive();
            if result.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(matches!(
            result,
            Err(CloseReason::ConnectFailed) | Err(CloseReason::Error)
        ));
    }
}
