use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vigil_core::{EmbeddingMatcher, FullFrameDetector, ThumbnailEmbedder};
use vigil_store::{ResultLog, SqliteBackend, WatchlistStore};
use vigild::dbus_interface::{VigilService, BUS_NAME, OBJECT_PATH};
use vigild::{
    AlertContext, AlertCoordinator, CommandSink, Config, DetectionPipeline, DirectorySource,
    LogSink, NotificationSink, StreamContext,
};

const LIVE_STREAM: &str = "live";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");
    let config = Config::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let backend = SqliteBackend::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?
        .into_shared();
    tracing::info!(path = %config.db_path.display(), "database opened");

    let watchlist = WatchlistStore::open(backend.clone())?;
    let log = Arc::new(ResultLog::open(backend, config.result_log_capacity)?);

    let sink: Arc<dyn NotificationSink> = match config
        .alert_command
        .as_deref()
        .and_then(CommandSink::from_command_line)
        .map(|command| command.with_timeout(config.notify_timeout))
    {
        Some(command) => {
            tracing::info!(?command, "alerts delivered by command");
            Arc::new(command)
        }
        None => {
            tracing::info!("VIGIL_ALERT_COMMAND unset; alerts are logged only");
            Arc::new(LogSink)
        }
    };
    if config.alert_destination.is_none() {
        tracing::warn!("VIGIL_ALERT_DESTINATION unset; alerts will stay pending");
    }
    let alerts = Arc::new(AlertCoordinator::new(
        watchlist.clone(),
        sink,
        config.notify_timeout,
    ));

    // No face model ships: whole frames are treated as faces and compared
    // with the thumbnail embedder.
    let matcher = EmbeddingMatcher::new(ThumbnailEmbedder::default(), config.match_threshold);
    tracing::info!(threshold = matcher.threshold(), "matcher ready");
    let pipeline = Arc::new(
        DetectionPipeline::new(
            Arc::new(FullFrameDetector::default()),
            Arc::new(matcher),
            watchlist,
            log.clone(),
        )
        .with_alerts(alerts),
    );

    let context = StreamContext {
        alert: AlertContext {
            destination: config.alert_destination.clone(),
            custom_message: config.alert_message.clone(),
        },
    };

    let cancel = CancellationToken::new();
    let stream_task = match &config.frame_dir {
        Some(dir) => {
            let source = DirectorySource::open(dir)
                .with_context(|| format!("failed to open frame directory {}", dir.display()))?;
            pipeline.start(LIVE_STREAM, context.clone());
            Some(tokio::spawn(pipeline.clone().run_stream(
                LIVE_STREAM.to_string(),
                source,
                config.frame_interval,
                cancel.clone(),
            )))
        }
        None => {
            tracing::info!("VIGIL_FRAME_DIR unset; no live stream");
            None
        }
    };

    let service = VigilService::new(pipeline.clone(), context);
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    cancel.cancel();
    if let Some(task) = stream_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "stream task failed");
        }
    }
    pipeline.stop(LIVE_STREAM);
    log.flush()?;

    Ok(())
}
