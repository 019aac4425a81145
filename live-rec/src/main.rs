use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use live_rec::capture::CaptureContext;
use live_rec::config::CaptureConfig;
use live_rec::events::EventBus;
use live_rec::fallback::{FallbackSets, spawn_pinned_refresh};
use live_rec::lock::LockManager;
use live_rec::logging;
use live_rec::recorder::{FfmpegRecorder, Recorder};
use live_rec::registry::{FileTargetSource, TargetRegistry, spawn_refresh};
use live_rec::scheduler::{Dispatcher, DispatcherConfig};
use live_rec::utils::fs;

#[derive(Parser, Debug)]
#[command(name = "live-rec", version, about = "Record live streams for a changing set of targets")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "LIVE_REC_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. "live_rec=debug"
    #[arg(long)]
    log_filter: Option<String>,

    /// Purge stale locks and exit
    #[arg(long)]
    purge_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = CaptureConfig::load(args.config.as_deref()).context("loading configuration")?;

    let filter = args.log_filter.as_deref().or(config.log_filter.as_deref());
    let (logging_handle, _log_guard) =
        logging::init_logging(&config.log_dir, filter).context("initializing logging")?;

    let locks = LockManager::with_dir(&config.lock_dir)?;
    let purged = locks.purge_all().await?;
    if args.purge_only {
        info!(purged, "Purge complete");
        return Ok(());
    }

    for (op, dir) in [
        ("creating segments directory", &config.segments_dir),
        ("creating output directory", &config.output_dir),
    ] {
        fs::ensure_dir_all_with_op(op, dir).await?;
    }

    let recorder = Arc::new(FfmpegRecorder::new(config.recorder.clone()));
    let status = recorder.status();
    match status.version {
        Some(version) if status.available => info!(
            tool = %status.name,
            version = %version,
            path = ?process_utils::find_program(&config.recorder.binary_path),
            "Recording tool detected"
        ),
        _ => error!(
            path = %config.recorder.binary_path,
            "Recording tool not found; captures will fail until it is installed"
        ),
    }

    let fallback = Arc::new(
        FallbackSets::load(
            &config.fallback_file,
            Some(config.always_secondary_file.as_path()),
        )
        .await?,
    );
    let ctx = Arc::new(CaptureContext::from_config(
        &config,
        locks,
        fallback.clone(),
        recorder,
        EventBus::default(),
    )?);

    let cancel = CancellationToken::new();
    let registry = Arc::new(TargetRegistry::new());
    let refresh = spawn_refresh(
        registry.clone(),
        FileTargetSource::new(&config.targets_file),
        config.registry_refresh_interval(),
        cancel.child_token(),
    );
    let pinned = spawn_pinned_refresh(
        fallback,
        config.always_secondary_file.clone(),
        config.registry_refresh_interval(),
        cancel.child_token(),
    );
    logging_handle.start_retention_cleanup(config.log_retention_days, cancel.child_token());
    #[cfg(unix)]
    spawn_filter_reload(logging_handle.clone(), args.config.clone(), cancel.child_token())?;

    let dispatcher = Dispatcher::new(registry, ctx, DispatcherConfig::from(&config));
    let dispatch = tokio::spawn(dispatcher.run(cancel.child_token()));

    info!(
        targets_file = %config.targets_file.display(),
        output_dir = %config.output_dir.display(),
        "live-rec running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    let tasks = [
        ("dispatcher", dispatch),
        ("registry refresh", refresh),
        ("pinned refresh", pinned),
    ];
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("live-rec stopped");
    Ok(())
}

/// Re-read the configuration's log filter on SIGHUP.
#[cfg(unix)]
fn spawn_filter_reload(
    handle: Arc<logging::LoggingHandle>,
    config_path: Option<PathBuf>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let directive = match CaptureConfig::load(config_path.as_deref()) {
                        Ok(config) => config
                            .log_filter
                            .unwrap_or_else(|| logging::DEFAULT_LOG_FILTER.to_string()),
                        Err(e) => {
                            warn!(error = %e, "Failed to reload configuration, keeping log filter");
                            continue;
                        }
                    };
                    if let Err(e) = handle.set_filter(&directive) {
                        warn!(error = %e, "Failed to apply log filter");
                    }
                }
            }
        }
    });
    Ok(())
}
