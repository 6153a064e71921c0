//! visit-audit: reconciles terminal master data with visit and scan events.
//! Each run works in its own disposable schema, dropped again on exit.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use visit_audit::db::{SchemaLifecycle, StoreConfig, StoreLocation};
use visit_audit::{api, AppState};

#[derive(Parser)]
#[command(name = "visit-audit", version, about = "Terminal visit/scan reconciliation service")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8013", env = "AUDIT_PORT")]
    port: u16,

    /// Directory for schema databases, or ":memory:"
    #[arg(short, long, default_value = "data", env = "AUDIT_DATA_DIR")]
    data_dir: String,

    /// Schema names are "<prefix>_<unix millis>"
    #[arg(long, default_value = "terminal", env = "AUDIT_SCHEMA_PREFIX")]
    schema_prefix: String,

    /// Max pooled connections per schema
    #[arg(long, default_value = "8", env = "AUDIT_POOL_SIZE")]
    pool_size: u32,

    /// Upper bound for any single store call
    #[arg(long, default_value = "30", env = "AUDIT_STORE_TIMEOUT_SECS")]
    store_timeout_secs: u64,

    /// Request body limit in MiB
    #[arg(long, default_value = "256", env = "AUDIT_BODY_LIMIT_MB")]
    body_limit_mb: usize,

    /// Leave the active schema on disk at exit
    #[arg(long, env = "AUDIT_KEEP_SCHEMA")]
    keep_schema_on_exit: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = StoreConfig {
        location: StoreLocation::from_arg(&args.data_dir),
        schema_prefix: args.schema_prefix.clone(),
        pool_size: args.pool_size,
        timeout: Duration::from_secs(args.store_timeout_secs),
        keep_on_exit: args.keep_schema_on_exit,
    };
    let lifecycle = match SchemaLifecycle::new(config) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // nothing to fall back to before the first schema exists
    let schema = match lifecycle.initialize().await {
        Ok(name) => name,
        Err(e) => {
            error!(error = %e, "database initialization failed");
            drop(lifecycle);
            std::process::exit(1);
        }
    };

    let body_limit = args.body_limit_mb.saturating_mul(1024 * 1024);
    let state = AppState::new(lifecycle).with_body_limit(body_limit);
    let app = api::router(state.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        data_dir = %args.data_dir,
        schema = %schema,
        "visit-audit starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // last handle on the lifecycle: dropping it tears the schema down
    drop(state);
    info!("stopped");
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}
