//! Listener setup and the accept dispatcher.
//!
//! The accept loop turns each client into a worker-owned connection bound
//! to the current primary: sample the routing state once, open a
//! non-blocking backend socket, allocate the record with both pipes, and
//! hand it to the least-loaded worker.

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TcpConfig};
use crate::conn::{Conn, ConnState};
use crate::frame;
use crate::registry::Registry;
use crate::routing::RoutingState;
use crate::signal;
use crate::worker::WorkerPool;

const LISTEN_BACKLOG: i32 = 4096;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// Bind the client listener. An IPv6 wildcard is tried with `IPV6_V6ONLY`
/// off so one socket serves both families; if IPv6 is unavailable, fall
/// back to the IPv4 wildcard.
pub fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    match try_bind(host, port) {
        Ok(listener) => Ok(listener),
        Err(e) if host == "::" => {
            warn!(port, error = %e, "IPv6 unavailable; falling back to 0.0.0.0");
            try_bind("0.0.0.0", port)
        }
        Err(e) => Err(e),
    }
}

fn try_bind(host: &str, port: u16) -> io::Result<TcpListener> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match bind_addr(&addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to bind")
    }))
}

fn bind_addr(addr: &SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let _ = socket.set_reuse_port(true);
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(false);
    }
    socket.bind(&(*addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn set_tcp_opts(sock: SockRef<'_>, tcp: &TcpConfig) {
    let _ = sock.set_nodelay(true);
    if tcp.keepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        let _ = sock.set_tcp_keepalive(&keepalive);
    }
}

/// Turn one accepted client into a worker-owned connection. Every failure
/// after the accept is local to this client: close what was opened, log
/// at debug, keep accepting.
pub fn dispatch(
    mut client: TcpStream,
    registry: &Registry,
    routing: &RoutingState,
    pool: &WorkerPool,
    tcp: &TcpConfig,
) {
    if client.set_nonblocking(true).is_err() {
        return;
    }
    set_tcp_opts(SockRef::from(&client), tcp);

    // One sample binds the connection: the epoch read here is consistent
    // with the index thanks to the acquire on the index load.
    let (primary, epoch) = routing.sample();
    if primary < 0 || primary as usize >= registry.len() {
        frame::send_error(&mut client, "no healthy PostgreSQL primary available");
        return;
    }

    let Some(target) = registry.get(primary as usize).and_then(|c| c.resolved()) else {
        frame::send_error(&mut client, "no healthy PostgreSQL primary available");
        return;
    };

    let socket = match Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
    {
        Ok(socket) => socket,
        Err(e) => {
            debug!(error = %e, "backend socket creation failed");
            return;
        }
    };
    if socket.set_nonblocking(true).is_err() {
        return;
    }
    set_tcp_opts(SockRef::from(&socket), tcp);

    let state = match socket.connect(&target.into()) {
        Ok(()) => ConnState::Established,
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            ConnState::Connecting
        }
        Err(e) => {
            debug!(backend = %target, error = %e, "backend connect failed");
            return;
        }
    };

    let conn = match Conn::new(client, socket.into(), state, epoch) {
        Ok(conn) => conn,
        Err(e) => {
            debug!(error = %e, "pipe creation failed");
            return;
        }
    };

    pool.least_loaded().dispatch(conn);
}

/// Bind the configured listener and serve until shutdown.
pub fn run(
    config: &Config,
    registry: Arc<Registry>,
    routing: Arc<RoutingState>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    let listener = bind_listener(&config.listen.host, config.listen.port)?;
    run_with_listener(listener, config, registry, routing, shutdown)
}

/// Serve an already-bound listener until shutdown.
pub fn run_with_listener(
    listener: TcpListener,
    config: &Config,
    registry: Arc<Registry>,
    routing: Arc<RoutingState>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    signal::ignore_sigpipe();

    let pool = WorkerPool::spawn(config.workers.threads, routing.clone(), shutdown.clone())?;
    info!(
        addr = %listener.local_addr()?,
        workers = pool.len(),
        "gateway started"
    );

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _peer)) => dispatch(stream, &registry, &routing, &pool, &config.tcp),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }

    info!("shutting down");
    drop(listener);
    shutdown.store(true, Ordering::SeqCst);
    pool.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ipv4_wildcard() {
        let listener = bind_listener("0.0.0.0", 0).unwrap();
        assert_eq!(listener.local_addr().unwrap().ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn binds_loopback_by_name() {
        let listener = bind_listener("localhost", 0).unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[test]
    fn wildcard_v6_listener_accepts_v4_clients() {
        let Ok(listener) = bind_listener("::", 0) else {
            return; // no IPv6 on this host; the fallback path is separate
        };
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::connect(("127.0.0.1", port));
        assert!(stream.is_ok());
    }
}
