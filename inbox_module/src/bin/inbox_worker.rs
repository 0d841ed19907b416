#[path = "inbox_worker/control.rs"]
mod control;

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use inbox_module::shadow::{HttpReplyDrafter, ReplyDrafter, ShadowReplyLoop};
use inbox_module::worker::{JobHandler, JobWorker, WorkerIdentity};
use inbox_module::{Inbox, InboxConfig, JobKind, QueueBackend};

use control::WorkerControl;

const ERROR_BACKOFF: Duration = Duration::from_secs(2);

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = InboxConfig::from_env()?;
    let inbox = Inbox::open(config, true)?;
    let handler: Arc<dyn JobHandler> = Arc::new(inbox.handlers()?);
    info!(
        "inbox worker db={} backend={:?} max_attempts={}",
        inbox.db.path().display(),
        inbox.config.queue_backend,
        inbox.config.queue.max_attempts
    );

    let mut control = WorkerControl::new();
    for kind in JobKind::ALL {
        if inbox.config.queue_backend == QueueBackend::Memory {
            // In-process wake-lists start empty; rebuild them from durable rows.
            let recovered = inbox.queue.recover_orphans(kind)?;
            if recovered > 0 {
                info!("recovered orphaned jobs kind={} count={}", kind, recovered);
            }
        }
        let worker = JobWorker::new(
            kind,
            inbox.queue.clone(),
            handler.clone(),
            inbox.heartbeats(),
            WorkerIdentity::current(),
            inbox.clock.clone(),
            inbox.config.retry,
            inbox.config.queue.dequeue_timeout,
        );
        control.spawn(format!("worker-{}", kind), move |stop| worker.run(&stop, ERROR_BACKOFF))?;
    }

    match &inbox.config.drafter {
        Some(settings) => {
            let drafter: Arc<dyn ReplyDrafter> = Arc::new(HttpReplyDrafter::new(
                settings.url.clone(),
                settings.token.clone(),
                settings.timeout,
            )?);
            let shadow_loop = ShadowReplyLoop::new(inbox.shadow.clone(), drafter, inbox.clock.clone());
            let idle = inbox.config.shadow_poll_interval;
            control.spawn("shadow-replies", move |stop| {
                if let Err(err) = shadow_loop.run(&stop, idle) {
                    error!("shadow reply loop stopped err={}", err);
                }
            })?;
        }
        None => warn!("REPLY_DRAFTER_URL is not set; shadow replies stay pending"),
    }

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal err={}", err);
        }
    });
    info!("shutdown requested; waiting for workers");
    control.stop_and_join();
    Ok(())
}
