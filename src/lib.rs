pub mod alerts;
pub mod config;
pub mod correlator;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod models;
pub mod recorder;
pub mod session;
pub mod transport;
mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use log::{error, info, warn, LevelFilter};

use config::ConfigStore;
use db::Database;
use dispatch::DirectoryFrameSource;
use recorder::SessionRecorder;
use session::{SessionController, SessionState};
use transport::TcpConnector;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

const CONFIG_ENV: &str = "DRIVEWATCH_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "drivewatch.json";

fn debug_mode() -> bool {
    std::env::var("DRIVEWATCH_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Sets up `env_logger`. `RUST_LOG` wins over the default level, which is
/// `debug` when `DRIVEWATCH_DEBUG` is set and `info` otherwise.
pub fn init_logging() {
    let level = if debug_mode() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    // A second init (tests, embedding apps) is harmless.
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}

/// Command-line runner: replays a directory of frames against the configured
/// backend for one session, until Ctrl-C or a terminal transport failure.
pub async fn run() -> anyhow::Result<()> {
    init_logging();
    info!("drivewatch starting up...");

    let config_path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let store = ConfigStore::new(config_path)?;
    let config = store.config();
    config.validate()?;

    let database = Database::new(config.database_path.clone())?;
    let recorder = SessionRecorder::new(database);

    // Close out sessions left running by a crash.
    let recovered = recorder.recover_interrupted().await?;
    if !recovered.is_empty() {
        warn!("marked {} unfinished sessions as interrupted", recovered.len());
    }

    let frames_dir = config
        .frames_dir
        .clone()
        .with_context(|| format!("framesDir is not set in {}", store.path().display()))?;
    let source = DirectoryFrameSource::open(
        &frames_dir,
        Duration::from_millis(config.dispatch.source_interval_ms),
    )?;
    info!("replaying {} frames from {}", source.len(), frames_dir.display());

    let connector = Arc::new(TcpConnector::new(config.backend_addr.clone()));
    let controller = SessionController::new(config, recorder, connector, Box::new(source))?;

    let session = controller.start().await?;
    info!("recording session {}", session.id);

    let mut status = controller.subscribe_status();
    let failure = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping");
                break None;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break None;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.session_state == SessionState::Error {
                    break Some(snapshot.last_error.unwrap_or_else(|| "unknown failure".into()));
                }
            }
        }
    };

    if let Some(reason) = failure {
        error!("session {} failed: {reason}", session.id);
        controller.reset().await?;
        return Err(anyhow!(reason));
    }

    let closed = controller.stop().await?;
    let summary = controller.recorder().summarize_session(&closed.id).await?;
    let metrics = controller.metrics().get_snapshot().await;
    info!(
        "session {} ended after {}ms: {} records, {} frames sent, {} dropped",
        closed.id,
        closed.duration_ms.unwrap_or(0),
        summary.record_count,
        metrics.dispatch.sent,
        metrics.dispatch.dropped()
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
