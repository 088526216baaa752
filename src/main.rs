use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailroom::config::MailroomConfig;
use mailroom::shutdown::ShutdownSignal;
use mailroom::tasks::foreman::{self, Foreman};
use mailroom::tasks::queue::{BATCH_QUEUE, HANDLER_QUEUE};
use mailroom::{web, Runtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MailroomConfig::load()?;
    let bind_addr = format!("{}:{}", config.server.address, config.server.port);
    info!(version = %config.version, worker = %config.worker_name(), "Mailroom starting");

    let batch_workers = config.worker.batch_workers;
    let handler_workers = config.worker.handler_workers;
    let rt = Arc::new(Runtime::connect(config).await?);

    let shutdown = ShutdownSignal::new();
    let batch = Foreman::new(rt.clone(), BATCH_QUEUE, batch_workers);
    let handler = Foreman::new(rt.clone(), HANDLER_QUEUE, handler_workers);
    let mut workers = batch.start(&shutdown);
    workers.extend(handler.start(&shutdown));

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Mailroom listening");

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, web::router(rt.clone()))
        .with_graceful_shutdown(async move { server_shutdown.recv().await })
        .await;
    if let Err(e) = served {
        error!(error = %e, "Server error");
        shutdown.trigger();
    }

    foreman::drain(workers, shutdown.timeout()).await;

    let (processed, failed, panicked) = batch.stats().snapshot();
    info!(queue = BATCH_QUEUE, processed, failed, panicked, "Batch foreman stopped");
    let (processed, failed, panicked) = handler.stats().snapshot();
    info!(queue = HANDLER_QUEUE, processed, failed, panicked, "Handler foreman stopped");

    info!("Mailroom shutdown complete");
    Ok(())
}
