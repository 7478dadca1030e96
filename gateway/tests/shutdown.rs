//! Shutdown behavior: clearing the running flag stops the accept loop,
//! wakes the workers and drops in-flight connections without draining.

use pg_gateway::config::Config;
use pg_gateway::registry::Registry;
use pg_gateway::routing::RoutingState;
use pg_gateway::server;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn shutdown_stops_server_and_drops_connections() {
    // A backend that holds connections open.
    let backend = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut held = Vec::new();
        while let Ok((stream, _)) = backend.accept() {
            held.push(stream);
        }
    });

    let mut config = Config::default();
    config.workers.threads = 2;
    let registry = Arc::new(
        Registry::parse(&format!("127.0.0.1:{}", backend_port), &config.probe).unwrap(),
    );
    let routing = Arc::new(RoutingState::new());
    routing.publish(Some(0));
    let shutdown = Arc::new(AtomicBool::new(false));

    let listener = server::bind_listener("127.0.0.1", 0).unwrap();
    let addr = listener.local_addr().unwrap();
    let server_thread = {
        let routing = routing.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || server::run_with_listener(listener, &config, registry, routing, shutdown))
    };

    // An in-flight connection.
    let mut client = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    shutdown.store(true, Ordering::SeqCst);

    // The server thread exits once the accept loop notices the flag and
    // the workers return from their bounded poll.
    server_thread.join().unwrap().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "shutdown took {:?}",
        start.elapsed()
    );

    // The in-flight connection was dropped, not drained.
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 8];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected bytes at shutdown: {}", n),
        Err(e) => panic!("connection not dropped: {}", e),
    }

    // New connections are refused once the listener is gone.
    thread::sleep(Duration::from_millis(100));
    let refused = TcpStream::connect_timeout(&addr, Duration::from_millis(300));
    assert!(refused.is_err());
}
