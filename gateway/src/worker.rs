//! Forwarder workers.
//!
//! N identical event loops, each owning a private `mio::Poll` (epoll,
//! edge-triggered), a wakeup channel and a load counter. The accept path
//! picks the least-loaded worker and hands records over a crossbeam
//! channel; the worker adopts them into a generation-tagged slab and
//! registers both sockets under a (generation, slot) token.
//!
//! The generation tag is what makes teardown safe under concurrent event
//! batches: a readiness event delivered for a record that was already
//! torn down carries a stale generation and is ignored, so no event can
//! ever reach a reclaimed record.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::conn::{CloseReason, Conn, ConnState};
use crate::metrics;
use crate::routing::RoutingState;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 4096;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pack (slot, generation) into a token. Slots stay far below 2^32, so
/// the waker token can never collide.
fn token_for(slot: usize, generation: u32) -> Token {
    Token(((generation as usize) << 32) | slot)
}

fn split_token(token: Token) -> (usize, u32) {
    (token.0 & 0xFFFF_FFFF, (token.0 >> 32) as u32)
}

/// Accept-side handle to one worker.
pub struct WorkerHandle {
    pub id: usize,
    tx: Sender<Conn>,
    waker: Arc<Waker>,
    load: Arc<AtomicI64>,
}

impl WorkerHandle {
    /// Current number of connections owned by this worker.
    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Relaxed)
    }

    /// Hand a connection record to this worker: bump the load counter and
    /// the connection metrics together, mark the record registered, send
    /// it over the channel and wake the worker.
    pub fn dispatch(&self, mut conn: Conn) {
        conn.registered = true;
        self.load.fetch_add(1, Ordering::Relaxed);
        metrics::connection_registered();

        if self.tx.send(conn).is_err() {
            // Worker already exited (shutdown); undo and drop the record.
            self.load.fetch_sub(1, Ordering::Relaxed);
            metrics::connection_closed();
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(worker = self.id, error = %e, "failed to wake worker");
        }
    }

    /// Wake the worker without sending anything.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// The set of spawned workers.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` forwarder threads.
    pub fn spawn(
        count: usize,
        routing: Arc<RoutingState>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);

        for id in 0..count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (tx, rx) = unbounded::<Conn>();
            let load = Arc::new(AtomicI64::new(0));

            let worker = Worker {
                id,
                poll,
                rx,
                load: load.clone(),
                routing: routing.clone(),
                shutdown: shutdown.clone(),
                conns: Slab::with_capacity(1024),
                gens: Vec::new(),
                last_epoch: routing.epoch(),
            };

            let join = std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker.run())?;

            handles.push(WorkerHandle {
                id,
                tx,
                waker,
                load,
            });
            joins.push(join);
        }

        Ok(Self { handles, joins })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Worker with the minimum load; ties broken by lowest index.
    pub fn least_loaded(&self) -> &WorkerHandle {
        self.handles
            .iter()
            .min_by_key(|h| h.load())
            .expect("worker pool is never empty")
    }

    /// Per-worker load counters, in worker order.
    pub fn loads(&self) -> Vec<i64> {
        self.handles.iter().map(|h| h.load()).collect()
    }

    /// Wake every worker so a cleared shutdown flag is observed promptly.
    pub fn wake_all(&self) {
        for handle in &self.handles {
            handle.wake();
        }
    }

    /// Wake and join all workers.
    pub fn join(mut self) {
        self.wake_all();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

/// One forwarder event loop. Owns every connection record handed to it.
struct Worker {
    id: usize,
    poll: Poll,
    rx: Receiver<Conn>,
    load: Arc<AtomicI64>,
    routing: Arc<RoutingState>,
    shutdown: Arc<AtomicBool>,
    conns: Slab<Conn>,
    /// Per-slot generation, bumped at teardown so stale tokens miss.
    gens: Vec<u32>,
    last_epoch: u64,
}

impl Worker {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(worker = self.id, "worker started");

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.id, error = %e, "poll failed");
                break;
            }

            self.drain_incoming();

            // One epoch snapshot per batch; a publication during the batch
            // is picked up on the next iteration.
            let cur_epoch = self.routing.epoch();
            if cur_epoch != self.last_epoch {
                self.cull_stale(cur_epoch);
                self.last_epoch = cur_epoch;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue; // channel already drained above
                }

                let (slot, generation) = split_token(token);
                if self.gens.get(slot).copied() != Some(generation) || !self.conns.contains(slot) {
                    continue; // event for a record torn down earlier
                }

                if self.conns[slot].epoch != cur_epoch {
                    self.teardown(slot, CloseReason::StaleEpoch);
                    continue;
                }

                match self.conns[slot].drive() {
                    Ok(()) => self.rearm(slot),
                    Err(reason) => self.teardown(slot, reason),
                }
            }
        }

        self.close_all();
        info!(worker = self.id, "worker stopped");
    }

    /// Adopt all connection records queued by the accept path.
    fn drain_incoming(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(conn) => self.adopt(conn),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Insert a record into the slab and register both sockets.
    fn adopt(&mut self, conn: Conn) {
        if conn.epoch != self.routing.epoch() {
            debug!(worker = self.id, "dropping connection stale on arrival");
            self.release(conn);
            return;
        }

        let backend_interest = if conn.state == ConnState::Connecting {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let slot = self.conns.insert(conn);
        if slot >= self.gens.len() {
            self.gens.resize(slot + 1, 0);
        }
        let token = token_for(slot, self.gens[slot]);

        let client_fd = self.conns[slot].client.as_raw_fd();
        let backend_fd = self.conns[slot].backend.as_raw_fd();

        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&client_fd), token, Interest::READABLE)
        {
            debug!(worker = self.id, error = %e, "client registration failed");
            let conn = self.conns.remove(slot);
            self.gens[slot] = self.gens[slot].wrapping_add(1);
            self.release(conn);
            return;
        }
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&backend_fd), token, backend_interest)
        {
            debug!(worker = self.id, error = %e, "backend registration failed");
            let _ = self.poll.registry().deregister(&mut SourceFd(&client_fd));
            let conn = self.conns.remove(slot);
            self.gens[slot] = self.gens[slot].wrapping_add(1);
            self.release(conn);
            return;
        }

        // Run one step immediately: readiness that predates registration
        // produces no further edge under EPOLLET.
        match self.conns[slot].drive() {
            Ok(()) => self.rearm(slot),
            Err(reason) => self.teardown(slot, reason),
        }
    }

    /// Recompute and apply readiness masks after a forwarding step. The
    /// masks flip whenever a pipe residual crosses zero, so this is
    /// unconditional.
    fn rearm(&mut self, slot: usize) {
        let token = token_for(slot, self.gens[slot]);
        let conn = &self.conns[slot];

        let mut client_interest = Interest::READABLE;
        let mut backend_interest = Interest::READABLE;
        if conn.state == ConnState::Connecting {
            backend_interest = backend_interest | Interest::WRITABLE;
        } else {
            if conn.b2c.bytes_queued() > 0 {
                client_interest = client_interest | Interest::WRITABLE;
            }
            if conn.c2b.bytes_queued() > 0 {
                backend_interest = backend_interest | Interest::WRITABLE;
            }
        }

        let client_fd = conn.client.as_raw_fd();
        let backend_fd = conn.backend.as_raw_fd();
        let _ = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&client_fd), token, client_interest);
        let _ = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&backend_fd), token, backend_interest);
    }

    /// Cull every owned record bound to a different epoch.
    fn cull_stale(&mut self, cur_epoch: u64) {
        let stale: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.epoch != cur_epoch)
            .map(|(slot, _)| slot)
            .collect();
        for slot in stale {
            self.teardown(slot, CloseReason::StaleEpoch);
        }
    }

    /// Remove a record, deregister its sockets and drop it. The slot
    /// generation is bumped so in-flight events for it become inert.
    fn teardown(&mut self, slot: usize, reason: CloseReason) {
        let conn = self.conns.remove(slot);
        self.gens[slot] = self.gens[slot].wrapping_add(1);

        let client_fd = conn.client.as_raw_fd();
        let backend_fd = conn.backend.as_raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&client_fd));
        let _ = self.poll.registry().deregister(&mut SourceFd(&backend_fd));

        match reason {
            CloseReason::BackendEof => {
                warn!(worker = self.id, "backend closed connection unexpectedly");
            }
            CloseReason::ClientEof => {
                debug!(worker = self.id, "client closed connection");
            }
            CloseReason::StaleEpoch => {
                debug!(
                    worker = self.id,
                    bound_epoch = conn.epoch,
                    "culling stale connection"
                );
            }
            CloseReason::ConnectFailed => {
                debug!(worker = self.id, "backend connect failed");
            }
            CloseReason::Error => {
                debug!(worker = self.id, "connection I/O error");
            }
            CloseReason::Shutdown => {
                debug!(worker = self.id, "dropping connection at shutdown");
            }
        }

        self.release(conn);
    }

    /// Final counter accounting. Decrements only records the accept path
    /// registered, so an early-failed record can never underflow.
    fn release(&mut self, conn: Conn) {
        if conn.registered {
            self.load.fetch_sub(1, Ordering::Relaxed);
            metrics::connection_closed();
        }
        // Dropping the record closes all six descriptors.
    }

    fn close_all(&mut self) {
        // Records still queued on the channel were registered by the
        // accept path; account for them before dropping.
        while let Ok(conn) = self.rx.try_recv() {
            self.release(conn);
        }
        let slots: Vec<usize> = self.conns.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.teardown(slot, CloseReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_packing_roundtrips() {
        for (slot, generation) in [(0, 0), (1, 0), (4095, 7), (123, u32::MAX - 1)] {
            let token = token_for(slot, generation);
            assert_ne!(token, WAKER_TOKEN);
            assert_eq!(split_token(token), (slot, generation));
        }
    }

    #[test]
    fn pool_spawns_and_joins() {
        let routing = Arc::new(RoutingState::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = WorkerPool::spawn(4, routing, shutdown.clone()).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.loads(), vec![0, 0, 0, 0]);
        assert_eq!(pool.least_loaded().id, 0);

        shutdown.store(true, Ordering::SeqCst);
        pool.join();
    }
}
