//! `canvasgen-worker` -- headless generation job runner.
//!
//! Reads a generation request (one job, or a list of jobs with optional
//! batch variations) as JSON from stdin, runs it through the job queue
//! against the configured generation server, writes images to
//! `OUTPUT_DIR`, and exits once the queue is idle.
//!
//! See [`canvasgen_worker::config::WorkerConfig::from_env`] for the
//! environment variables. The progress transport comes from the settings
//! file at `SETTINGS_PATH` and can be changed by a request's
//! `progress_mode` field.

use std::sync::Arc;

use anyhow::Context;
use canvasgen_client::api::SdApi;
use canvasgen_client::client::SocketClient;
use canvasgen_client::polling::{PollingConfig, PollingProgressMonitor};
use canvasgen_client::reconnect::ReconnectPolicy;
use canvasgen_client::service::ProgressService;
use canvasgen_client::socket::SocketProgressMonitor;
use canvasgen_core::progress::ProgressEvent;
use canvasgen_queue::events::QueueEvent;
use canvasgen_queue::queue::{JobQueue, QueueConfig};
use canvasgen_worker::config::WorkerConfig;
use canvasgen_worker::request::parse_request;
use canvasgen_worker::settings::Settings;
use canvasgen_worker::storage::{FsImageStore, LogCanvas};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "canvasgen_worker=info,canvasgen_queue=info,canvasgen_client=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read request from stdin")?;
    let request = parse_request(&input).context("Invalid generation request")?;

    let mut settings = Settings::load(&config.settings_path)
        .await
        .with_context(|| format!("Failed to load {}", config.settings_path.display()))?;
    if let Some(mode) = request.progress_mode {
        if mode != settings.progress_mode {
            settings.progress_mode = mode;
            settings
                .save(&config.settings_path)
                .await
                .context("Failed to save settings")?;
            tracing::info!(%mode, "Progress transport preference saved");
        }
    }

    tracing::info!(
        api_url = %config.api_url,
        socket_host = %config.socket_host,
        progress_mode = %settings.progress_mode,
        jobs = request.jobs.len(),
        "Starting canvasgen-worker",
    );

    let api = Arc::new(
        SdApi::with_timeout(config.api_url.clone(), config.request_timeout)
            .context("Failed to build HTTP client")?,
    );

    let progress = Arc::new(ProgressService::new(
        SocketProgressMonitor::new(
            SocketClient::new(&config.socket_host, config.socket_secure),
            ReconnectPolicy::default(),
        ),
        PollingProgressMonitor::new(Arc::clone(&api), PollingConfig::default()),
    ));
    let transport = progress.configure(settings.progress_mode).await;
    tracing::info!(transport, "Progress monitoring configured");

    let _progress_log = progress.subscribe(Arc::new(|event: &ProgressEvent| {
        tracing::debug!(
            current = event.current,
            total = event.total,
            phase = %event.phase,
            status = %event.status,
            "Generation progress",
        );
    }));

    let queue = JobQueue::new(
        QueueConfig {
            default_max_retries: config.max_retries,
            ..QueueConfig::default()
        },
        api,
        Arc::clone(&progress),
        Arc::new(FsImageStore::new(config.output_dir.clone())),
        Arc::new(LogCanvas),
    );
    let reporter = tokio::spawn(report_events(queue.subscribe()));

    for job in &request.jobs {
        let ids = job.submit(&queue).context("Failed to enqueue job")?;
        tracing::info!(kind = %job.kind, count = ids.len(), "Request enqueued");
    }

    queue.wait_idle().await;

    let stats = queue.stats();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        output_dir = %config.output_dir.display(),
        "All jobs settled",
    );

    queue.shutdown().await;
    progress.shutdown().await;
    reporter.abort();

    if stats.failed > 0 {
        anyhow::bail!("{} of {} jobs failed", stats.failed, stats.total());
    }
    Ok(())
}

/// Log queue lifecycle events until the channel closes.
async fn report_events(mut rx: broadcast::Receiver<QueueEvent>) {
    loop {
        match rx.recv().await {
            Ok(QueueEvent::Progress { job_id, percent, phase }) => {
                tracing::info!(job_id = %job_id, percent, phase = %phase, "Job progress");
            }
            Ok(QueueEvent::Completed { job_id, images }) => {
                tracing::info!(job_id = %job_id, images = ?images, "Job completed");
            }
            Ok(QueueEvent::Failed { job_id, error, will_retry }) => {
                tracing::warn!(job_id = %job_id, will_retry, error = %error, "Job failed");
            }
            Ok(event) => tracing::debug!(?event, "Queue event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Queue event reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
