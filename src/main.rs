use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use duplex_voice::audio::wav::{prune_recordings, recording_path_in, MAX_RECORDINGS};
use duplex_voice::audio::{CpalMicSource, MixRecorder};
use duplex_voice::error::RecordingError;
use duplex_voice::settings::{apply_env_overrides, default_settings_path, load_settings};
use duplex_voice::transport::TransportExit;
use duplex_voice::{
    AppSettings, HttpComputePool, PipelineController, PipelineDeps, PipelineError,
    RealtimeTransport, SessionBroker, TransportError,
};

/// Encoded chunks waiting for the socket
const CHUNK_QUEUE: usize = 256;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Recording(#[from] RecordingError),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    duplex_voice::init_logging();

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    apply_env_overrides(&mut settings);
    log::info!("Settings loaded from {:?}", settings_path);

    let broker = SessionBroker::new(
        HttpComputePool::new(settings.session.pool_manager_url.clone()),
        settings.session.clone(),
    );

    let registration = broker.register().await;
    let url = match registration.websocket_url {
        Some(url) if registration.success => url,
        _ => {
            log::error!("cannot start: {}", registration.message);
            return ExitCode::FAILURE;
        }
    };
    log::info!("{}", registration.message);

    let result = run_session(&settings, &url).await;

    let released = broker.unregister().await;
    log::info!("{}", released.message);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Session ended with error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_session(settings: &AppSettings, url: &str) -> Result<(), RunError> {
    let mut transport = RealtimeTransport::connect(url).await?;

    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
    let controller = PipelineController::spawn(settings.audio.clone(), PipelineDeps::system(), chunk_tx);

    let handle = match controller.setup(Arc::new(CpalMicSource::new())).await {
        Ok(handle) => handle,
        Err(e) => {
            transport.disconnect().await;
            return Err(e.into());
        }
    };
    log::info!(
        "Pipeline {} running at {} Hz ({:?})",
        handle.id(),
        handle.sample_rate(),
        settings.audio.codec
    );

    let recorder = match &settings.audio.record_path {
        Some(target) => {
            let path = recording_target(target, handle.id());
            match MixRecorder::start(handle.mix(), &path) {
                Ok(recorder) => Some(recorder),
                Err(e) => {
                    log::error!("Failed to start recording to {:?}: {}", path, e);
                    controller.shutdown().await;
                    drop(handle);
                    transport.disconnect().await;
                    return Err(e.into());
                }
            }
        }
        None => None,
    };

    let outcome = {
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Ctrl-C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
            log::info!("Ctrl-C received, shutting down");
        };
        let run = transport.run_until(chunk_rx, handle.decoder().clone(), interrupted);
        tokio::pin!(run);
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        stats_tick.tick().await;

        loop {
            tokio::select! {
                result = &mut run => break result,
                _ = stats_tick.tick() => {
                    log::info!(
                        "mic {:.1}s, in {:.2} / out {:.2}, delay {:.0}ms, {:?}",
                        handle.mic_duration(),
                        handle.input_analyser().level(),
                        handle.output_analyser().level(),
                        handle.playout_delay() * 1000.0,
                        handle.stats()
                    );
                }
            }
        }
    };

    controller.shutdown().await;
    drop(handle);

    if let Some(recorder) = recorder {
        let summary = recorder.finish().await?;
        log::info!(
            "Recorded {:.1}s to {:?}",
            summary.duration_secs,
            summary.path
        );
    }

    transport.disconnect().await;
    match outcome {
        Ok(TransportExit::Interrupted) => log::info!("Session interrupted"),
        Ok(exit) => log::info!("Session ended ({:?})", exit),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// A directory target gets a fresh per-session file; older recordings are pruned.
fn recording_target(target: &Path, session_id: Uuid) -> PathBuf {
    if !target.is_dir() {
        return target.to_path_buf();
    }
    match prune_recordings(target, MAX_RECORDINGS.saturating_sub(1)) {
        Ok(0) => {}
        Ok(n) => log::info!("Pruned {} old recordings", n),
        Err(e) => log::warn!("Failed to prune recordings in {:?}: {}", target, e),
    }
    recording_path_in(target, session_id)
}
