//! pg-gateway binary.

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use pg_gateway::{Config, Registry, RoutingState, admin, health, logging, server, signal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "pg-gateway")]
#[command(about = "Transparent TCP load balancer for a replicated PostgreSQL cluster")]
struct Args {
    /// Listen address (falls back to LISTEN_HOST, default "localhost")
    listen_addr: Option<String>,

    /// Listen port (falls back to LISTEN_PORT, default "5432")
    listen_port: Option<String>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    if args.listen_addr.is_some() != args.listen_port.is_some() {
        eprintln!("Usage: pg-gateway [<listen_addr> <listen_port>]");
        eprintln!("       Or set LISTEN_HOST and LISTEN_PORT environment variables");
        std::process::exit(1);
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = config.apply_env() {
        eprintln!("Invalid environment: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = config.apply_args(args.listen_addr.as_deref(), args.listen_port.as_deref()) {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    logging::init(&config.logging);

    let shutdown = signal::install_signal_handler();

    let Some(candidates) = config.candidates.clone() else {
        tracing::error!("CANDIDATES env var required");
        std::process::exit(1);
    };
    let registry = match Registry::parse(&candidates, &config.probe) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "invalid candidate list");
            std::process::exit(1);
        }
    };

    let routing = Arc::new(RoutingState::new());

    let prober = match health::Prober::spawn(
        registry.clone(),
        routing.clone(),
        config.probe.clone(),
        shutdown.clone(),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start health prober");
            std::process::exit(1);
        }
    };

    // A metrics endpoint failure is not fatal to the gateway.
    let admin = match admin::start(&config.metrics.host, config.metrics.port) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "failed to start metrics endpoint");
            None
        }
    };

    if let Err(e) = server::run(&config, registry, routing, shutdown.clone()) {
        tracing::error!(error = %e, "gateway error");
        std::process::exit(1);
    }

    shutdown.store(true, Ordering::SeqCst);
    let _ = prober.join();
    if let Some(admin) = admin {
        admin.shutdown();
    }
}

fn print_default_config() {
    let config = r#"# pg-gateway configuration

# Comma-separated host:port candidate backends (env: CANDIDATES)
# candidates = "10.0.0.10:5432,10.0.0.11:5432"

[listen]
# Client listener (env: LISTEN_HOST / LISTEN_PORT, or positional args)
host = "localhost"
port = 5432

[workers]
# Number of forwarder threads, clamped to [1, 64] (env: NUM_THREADS)
threads = 1

[probe]
# Database used for probe sessions (env: PGDATABASE)
dbname = "postgres"

# Probe channel connect timeout in milliseconds (env: CONNECT_TIMEOUT_MS)
connect_timeout_ms = 800

# Server-side statement timeout for probe queries (env: QUERY_TIMEOUT_MS)
query_timeout_ms = 500

# Seconds between probe cycles (env: CHECK_EVERY)
check_every_secs = 2

# Probe credentials (env: PGUSER / PGPASSWORD)
# user = "health"
# password = "secret"

[tcp]
# Keepalive on client and backend sockets (env: TCP_KEEPALIVE, "0" disables)
keepalive = true

[metrics]
# Prometheus endpoint (env: METRICS_HOST / METRICS_PORT)
host = "::"
port = 9090

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"

# Tag events with the originating thread (worker-N, health, metrics)
thread_names = true
"#;
    print!("{}", config);
}
