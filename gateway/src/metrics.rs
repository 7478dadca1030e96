//! Gateway metrics.
//!
//! Process-wide atomic counters incremented by the accept path, the
//! workers and the prober; exposed in Prometheus text format by the
//! admin endpoint.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "pg_gateway_connections_active",
    description = "Current number of active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "pg_gateway_connections_total",
    description = "Total number of connections since start"
)]
pub static CONNECTIONS_TOTAL: Counter = Counter::new();

#[metric(
    name = "pg_gateway_bytes_client_to_backend_total",
    description = "Total bytes transferred from clients to backend"
)]
pub static BYTES_CLIENT_TO_BACKEND: Counter = Counter::new();

#[metric(
    name = "pg_gateway_bytes_backend_to_client_total",
    description = "Total bytes transferred from backend to clients"
)]
pub static BYTES_BACKEND_TO_CLIENT: Counter = Counter::new();

#[metric(
    name = "pg_gateway_servers_total",
    description = "Total number of configured backend servers"
)]
pub static SERVERS_TOTAL: Gauge = Gauge::new();

#[metric(
    name = "pg_gateway_servers_healthy",
    description = "Number of healthy backend servers"
)]
pub static SERVERS_HEALTHY: Gauge = Gauge::new();

#[metric(
    name = "pg_gateway_servers_unhealthy",
    description = "Number of unhealthy backend servers"
)]
pub static SERVERS_UNHEALTHY: Gauge = Gauge::new();

/// Record a registered connection: the active gauge and the total counter
/// move together so teardown can decrement symmetrically.
pub fn connection_registered() {
    CONNECTIONS_ACTIVE.increment();
    CONNECTIONS_TOTAL.increment();
}

/// Record teardown of a registered connection.
pub fn connection_closed() {
    CONNECTIONS_ACTIVE.decrement();
}

/// Update the per-scan backend health gauges.
pub fn set_server_counts(total: usize, healthy: usize) {
    SERVERS_TOTAL.set(total as i64);
    SERVERS_HEALTHY.set(healthy as i64);
    SERVERS_UNHEALTHY.set(total.saturating_sub(healthy) as i64);
}
