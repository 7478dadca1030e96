//! Counter symmetry under early setup failures.
//!
//! When connection setup fails before the record is registered (socket or
//! pipe creation under descriptor exhaustion), no counter may move: the
//! active-connections gauge and the per-worker load counters stay at zero.
//!
//! Runs in its own test binary: it exhausts the descriptor table and
//! reads process-global counters.

use pg_gateway::config::{ProbeConfig, TcpConfig};
use pg_gateway::registry::Registry;
use pg_gateway::routing::RoutingState;
use pg_gateway::worker::WorkerPool;
use pg_gateway::{metrics, server};
use std::fs::File;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Open /dev/null until the descriptor table is full.
fn exhaust_fds() -> Vec<File> {
    let mut hog = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(f) => hog.push(f),
            Err(_) => break,
        }
    }
    hog
}

#[test]
fn early_failure_never_moves_counters() {
    // A real backend so a successful connect would be possible.
    let backend = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut held = Vec::new();
        while let Ok((stream, _)) = backend.accept() {
            held.push(stream);
        }
    });

    let probe = ProbeConfig::default();
    let registry = Registry::parse(&format!("127.0.0.1:{}", backend_port), &probe).unwrap();
    let routing = Arc::new(RoutingState::new());
    routing.publish(Some(0));
    let shutdown = Arc::new(AtomicBool::new(false));
    let pool = WorkerPool::spawn(1, routing.clone(), shutdown.clone()).unwrap();
    let tcp = TcpConfig::default();

    // Client sockets must exist before the table fills up.
    let entry = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry_addr = entry.local_addr().unwrap();

    let _client_a = TcpStream::connect(entry_addr).unwrap();
    let (accepted_a, _) = entry.accept().unwrap();
    let _client_b = TcpStream::connect(entry_addr).unwrap();
    let (accepted_b, _) = entry.accept().unwrap();

    let mut hog = exhaust_fds();

    // No descriptors at all: backend socket creation fails.
    server::dispatch(accepted_a, &registry, &routing, &pool, &tcp);
    assert_eq!(pool.loads(), vec![0]);

    // Exactly one descriptor free: the backend socket is created but pipe
    // creation fails.
    hog.pop();
    server::dispatch(accepted_b, &registry, &routing, &pool, &tcp);
    assert_eq!(pool.loads(), vec![0]);

    drop(hog);

    assert_eq!(metrics::CONNECTIONS_ACTIVE.value(), 0);
    assert_eq!(metrics::CONNECTIONS_TOTAL.value(), 0);

    shutdown.store(true, Ordering::SeqCst);
    pool.join();
}
