//! Primary selection via health probing.
//!
//! A single long-running thread polls every candidate on a fixed cadence,
//! classifies it, and publishes the index of the current primary through
//! [`RoutingState`]. Probe channels are plain PostgreSQL sessions asking
//! `SHOW transaction_read_only`; a server answering "off" is the primary.
//! No probe failure is ever fatal: channels are lazily recreated and DNS
//! failures retried on the next cycle.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::metrics;
use crate::registry::Registry;
use crate::routing::RoutingState;

/// What one probe said about a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Scan-order classification of a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The primary the gateway routes to.
    Primary,
    /// A further primary seen after the first (split brain); recorded but
    /// never routed to.
    PrimaryNotUsed,
    Replica,
    Unhealthy(String),
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Primary => "Primary",
            Classification::PrimaryNotUsed => "Primary(not-used)",
            Classification::Replica => "Replica",
            Classification::Unhealthy(_) => "Unhealthy",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Classification::Replica => Some("read-only"),
            Classification::Unhealthy(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self, Classification::Unhealthy(_))
    }
}

/// Turn per-candidate probe results into classifications. The first
/// primary in scan order wins.
pub fn classify_scan(
    results: Vec<Result<Role, String>>,
) -> (Vec<Classification>, Option<usize>) {
    let mut winner = None;
    let classes = results
        .into_iter()
        .enumerate()
        .map(|(i, result)| match result {
            Ok(Role::Primary) => {
                if winner.is_none() {
                    winner = Some(i);
                    Classification::Primary
                } else {
                    Classification::PrimaryNotUsed
                }
            }
            Ok(Role::Replica) => Classification::Replica,
            Err(reason) => Classification::Unhealthy(reason),
        })
        .collect();
    (classes, winner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl AggregateState {
    fn label(self) -> &'static str {
        match self {
            AggregateState::Unknown => "UNKNOWN",
            AggregateState::Healthy => "HEALTHY",
            AggregateState::Unhealthy => "UNHEALTHY",
        }
    }
}

/// The health prober thread.
pub struct Prober {
    registry: Arc<Registry>,
    routing: Arc<RoutingState>,
    config: ProbeConfig,
    shutdown: Arc<AtomicBool>,
    /// Persistent probe channels, one slot per candidate. Owned by this
    /// thread only; the shared registry never holds a channel.
    clients: Vec<Option<postgres::Client>>,
    last_state: AggregateState,
}

impl Prober {
    /// Spawn the prober on its own thread.
    pub fn spawn(
        registry: Arc<Registry>,
        routing: Arc<RoutingState>,
        config: ProbeConfig,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        let clients = (0..registry.len()).map(|_| None).collect();
        let prober = Self {
            registry,
            routing,
            config,
            shutdown,
            clients,
            last_state: AggregateState::Unknown,
        };
        std::thread::Builder::new()
            .name("health".to_string())
            .spawn(move || prober.run())
    }

    fn run(mut self) {
        let interval = Duration::from_secs(self.config.check_every_secs.max(1));
        info!(
            candidates = self.registry.len(),
            interval_secs = interval.as_secs(),
            "health prober started"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            self.scan_once();
            std::thread::sleep(interval);
        }

        info!("health prober stopped");
    }

    /// One full scan: probe every candidate, publish the outcome, update
    /// gauges and log transitions.
    fn scan_once(&mut self) {
        let results: Vec<Result<Role, String>> = (0..self.registry.len())
            .map(|i| self.probe_candidate(i))
            .collect();
        let (classes, winner) = classify_scan(results);

        let healthy = classes.iter().filter(|c| c.is_healthy()).count();
        metrics::set_server_counts(self.registry.len(), healthy);

        // Map the winner back to a candidate index by structural address
        // equality; resolution failure downgrades the scan to "no primary".
        let new_primary = winner.and_then(|i| {
            let cand = self.registry.get(i).expect("winner index in range");
            match cand.resolve() {
                Ok(addr) => {
                    let idx = self.registry.index_of_addr(&addr);
                    if idx.is_none() {
                        warn!(
                            endpoint = %cand.endpoint(),
                            "primary address matches no candidate"
                        );
                    }
                    idx
                }
                Err(e) => {
                    warn!(
                        endpoint = %cand.endpoint(),
                        error = %e,
                        "found primary but DNS resolution failed"
                    );
                    None
                }
            }
        });

        let changed = self.routing.publish(new_primary).is_some();
        let new_state = if new_primary.is_some() {
            AggregateState::Healthy
        } else {
            AggregateState::Unhealthy
        };
        let epoch = self.routing.epoch();

        if changed || new_state != self.last_state {
            match new_primary {
                Some(idx) => {
                    let cand = self.registry.get(idx).expect("published index in range");
                    info!(
                        from = self.last_state.label(),
                        primary = %cand.endpoint(),
                        epoch,
                        "state change: HEALTHY"
                    );
                }
                None => {
                    let reason = classes
                        .iter()
                        .find_map(|c| match c {
                            Classification::Unhealthy(r) => Some(r.as_str()),
                            _ => None,
                        })
                        .unwrap_or("no primary reachable");
                    warn!(
                        from = self.last_state.label(),
                        reason,
                        epoch,
                        "state change: UNHEALTHY"
                    );
                }
            }
            self.last_state = new_state;
        }

        if changed {
            for (i, class) in classes.iter().enumerate() {
                let endpoint = self.registry.get(i).expect("index in range").endpoint();
                match class.reason() {
                    Some(reason) => {
                        info!(endpoint = %endpoint, status = class.label(), reason, "backend status")
                    }
                    None => info!(endpoint = %endpoint, status = class.label(), "backend status"),
                }
            }
        }
    }

    /// Probe one candidate, reopening its channel if needed.
    fn probe_candidate(&mut self, i: usize) -> Result<Role, String> {
        if let Some(client) = &self.clients[i]
            && client.is_closed()
        {
            self.clients[i] = None;
        }

        if self.clients[i].is_none() {
            let cand = self.registry.get(i).expect("index in range");

            // Re-resolve on reconnection so a moved host is picked up.
            cand.resolve()
                .map_err(|_| "DNS resolution failed".to_string())?;

            let mut client = postgres::Client::connect(&cand.conninfo, postgres::NoTls)
                .map_err(|e| format!("connect failed: {}", e))?;
            client
                .batch_execute(&format!(
                    "SET statement_timeout = {}",
                    self.config.query_timeout_ms
                ))
                .map_err(|e| format!("set statement_timeout failed: {}", e))?;
            self.clients[i] = Some(client);
        }

        let client = self.clients[i].as_mut().expect("client just ensured");
        match read_only_status(client) {
            Ok(false) => Ok(Role::Primary),
            Ok(true) => Ok(Role::Replica),
            Err(e) => {
                // Close the channel so the next cycle reconnects.
                self.clients[i] = None;
                Err(format!("read-only check failed: {}", e))
            }
        }
    }
}

/// Ask the server whether the current session is read-only.
fn read_only_status(client: &mut postgres::Client) -> Result<bool, postgres::Error> {
    let messages = client.simple_query("SHOW transaction_read_only")?;
    for message in messages {
        if let postgres::SimpleQueryMessage::Row(row) = message {
            return Ok(!row
                .get(0)
                .is_some_and(|v| v.eq_ignore_ascii_case("off")));
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_primary_in_scan_order_wins() {
        let (classes, winner) = classify_scan(vec![
            Ok(Role::Replica),
            Ok(Role::Primary),
            Ok(Role::Primary),
        ]);
        assert_eq!(winner, Some(1));
        assert_eq!(classes[0], Classification::Replica);
        assert_eq!(classes[1], Classification::Primary);
        assert_eq!(classes[2], Classification::PrimaryNotUsed);
    }

    #[test]
    fn failures_classify_unhealthy_with_reason() {
        let (classes, winner) = classify_scan(vec![
            Err("connect failed: refused".to_string()),
            Ok(Role::Replica),
        ]);
        assert_eq!(winner, None);
        assert_eq!(
            classes[0],
            Classification::Unhealthy("connect failed: refused".to_string())
        );
        assert_eq!(classes[0].reason(), Some("connect failed: refused"));
        assert_eq!(classes[1].reason(), Some("read-only"));
    }

    #[test]
    fn healthy_counts_include_replicas_and_spare_primaries() {
        let (classes, _) = classify_scan(vec![
            Ok(Role::Primary),
            Ok(Role::Primary),
            Ok(Role::Replica),
            Err("down".to_string()),
        ]);
        let healthy = classes.iter().filter(|c| c.is_healthy()).count();
        assert_eq!(healthy, 3);
    }

    #[test]
    fn empty_scan_selects_nothing() {
        let (classes, winner) = classify_scan(Vec::new());
        assert!(classes.is_empty());
        assert_eq!(winner, None);
    }
}
