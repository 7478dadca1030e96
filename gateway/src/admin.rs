//! HTTP endpoint for metrics exposition.
//!
//! Serves `GET /` and `GET /metrics` with the gateway counters in
//! Prometheus text format; anything else is a 404. Runs in a dedicated
//! thread with a single-threaded Tokio runtime so it never interferes
//! with the forwarding loops.

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::future::IntoFuture;

/// Handle returned by [`start`] for shutdown coordination.
pub struct AdminHandle {
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    join_handle: std::thread::JoinHandle<()>,
}

impl AdminHandle {
    /// Signal the admin server to shut down and wait for it to finish.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join_handle.join();
    }
}

/// Start the metrics endpoint in a dedicated thread.
pub fn start(host: &str, port: u16) -> std::io::Result<AdminHandle> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let host = host.to_string();

    let join_handle = std::thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create metrics runtime");

            rt.block_on(async move {
                run_admin_server(&host, port, shutdown_rx).await;
            });
        })?;

    Ok(AdminHandle {
        shutdown_tx,
        join_handle,
    })
}

async fn run_admin_server(
    host: &str,
    port: u16,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let app = Router::new()
        .route("/", get(metrics_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler);

    let listener = match tokio::net::TcpListener::bind((host, port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(error = %e, host, port, "failed to bind metrics endpoint");
            return;
        }
    };

    tracing::info!(host, port, "metrics endpoint listening");

    let server = axum::serve(listener, app).into_future();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics endpoint error");
            }
        }
        _ = shutdown_rx => {
            tracing::debug!("metrics endpoint received shutdown signal");
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(),
    )
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found\n")
}

/// Render every registered metric as HELP/TYPE/value triples.
fn render_prometheus() -> String {
    let mut output = String::with_capacity(4096);

    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if name.is_empty() {
            continue;
        }

        let value = match metric.value() {
            Some(v) => v,
            None => continue,
        };

        match value {
            metriken::Value::Counter(v) => {
                if let Some(description) = metric.description() {
                    output.push_str(&format!("# HELP {} {}\n", name, description));
                }
                output.push_str(&format!("# TYPE {} counter\n", name));
                output.push_str(&format!("{} {}\n", name, v));
            }
            metriken::Value::Gauge(v) => {
                if let Some(description) = metric.description() {
                    output.push_str(&format!("# HELP {} {}\n", name, description));
                }
                output.push_str(&format!("# TYPE {} gauge\n", name));
                output.push_str(&format!("{} {}\n", name, v));
            }
            _ => continue,
        }

        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_includes_gateway_metrics() {
        // Touch a gauge so the statics are registered.
        crate::metrics::SERVERS_TOTAL.set(crate::metrics::SERVERS_TOTAL.value());

        let body = render_prometheus();
        assert!(body.contains("# TYPE pg_gateway_connections_total counter"));
        assert!(body.contains("# TYPE pg_gateway_connections_active gauge"));
        assert!(body.contains("# TYPE pg_gateway_servers_total gauge"));
        assert!(body.contains("# TYPE pg_gateway_servers_healthy gauge"));
        assert!(body.contains("# TYPE pg_gateway_servers_unhealthy gauge"));
        assert!(body.contains("# HELP pg_gateway_bytes_client_to_backend_total"));
        assert!(body.contains("pg_gateway_bytes_backend_to_client_total"));
    }
}
