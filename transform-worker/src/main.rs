//! Poll the job queue and run transformation jobs.

use std::future::ready;
use std::sync::Mutex;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use transform_common::datastore::DataStore;
use transform_common::health::Liveness;
use transform_common::metrics::{serve, setup_metrics_routes};
use transform_common::queue::QueueManager;
use transform_worker::config::Config;
use transform_worker::processor::JobProcessor;
use transform_worker::supervisor::WorkerSupervisor;

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(&config);

    let queue = QueueManager::connect(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the job queue database");
    let store = DataStore::new(
        queue.pool().clone(),
        config.sandbox_max_output_rows,
        config.chunk_size,
    );
    let processor = JobProcessor::new(
        queue.clone(),
        store,
        config.sandbox_limits(),
        config.chunk_size,
    );

    let liveness = Liveness::new(chrono::Duration::seconds(60));
    let probe = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(probe.status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let supervisor = WorkerSupervisor::new(
        queue,
        processor,
        config.poll_interval.0,
        config.effective_max_jobs(),
        config.orphaned_job_policy,
        liveness,
    );

    supervisor.run(shutdown()).await;
}

async fn index() -> &'static str {
    "transform worker"
}

/// Resolve on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutdown signal received, draining...");
}

#[cfg(not(unix))]
async fn shutdown() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to register ctrl-c handler");
    tracing::info!("shutdown signal received, draining...");
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_file(config) {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .init(),
        None => registry.init(),
    }
}

fn log_file(config: &Config) -> Option<std::fs::File> {
    let dir = config.log_dir.as_ref()?;
    if let Err(error) = std::fs::create_dir_all(dir) {
        eprintln!("failed to create log directory {dir}: {error}");
        return None;
    }
    let path = std::path::Path::new(dir).join("worker.log");
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(error) => {
            eprintln!("failed to open {}: {error}", path.display());
            None
        }
    }
}
