use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trackrelay_dispatch::{DurableQueue, RedisQueue, WorkerLoop};

mod config;
mod error;
mod processor;
mod sweeper;

use config::Config;
use processor::CommandProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trackrelay_worker=debug,trackrelay_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    if let Some(path) = trackrelay_shared_config::load_dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }

    let config = Config::from_env()?;
    tracing::info!(
        environment = ?config.environment(),
        redis = %config.redis.redacted_url(),
        queue = %config.worker.keys.queue,
        command = %config.command.program,
        "Starting trackrelay worker"
    );

    if let Err(e) = sweeper::ensure_dir(&config.scratch.dir) {
        e.log();
        return Err(e.into());
    }

    let queue: Arc<dyn DurableQueue> = match RedisQueue::connect(&config.redis).await {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            tracing::error!(error = %e, "Redis unavailable, worker cannot start");
            return Err(e.into());
        }
    };

    let shutdown = install_shutdown_handler()?;

    let sweeper = tokio::spawn(sweeper::run(config.scratch.clone(), shutdown.child_token()));

    let processor = CommandProcessor::new(&config.command, &config.scratch.dir);
    tracing::info!(program = processor.program(), "Job command ready");
    let worker = WorkerLoop::new(Arc::clone(&queue), processor, config.worker.clone());

    let stats = worker.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Scratch sweeper ended abnormally");
    }
    queue.close().await;

    tracing::info!(
        processed = stats.processed,
        failed = stats.failed,
        lost_results = stats.lost_results,
        "Worker shut down"
    );
    Ok(())
}

/// Cancel the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> anyhow::Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, finishing current job before exit");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, finishing current job before exit");
            }
        }
        cancel.cancel();
    });

    Ok(token)
}
