//! Mix recording to WAV
//!
//! `MixRecorder` subscribes to the mix destination and writes every block
//! (mic + AI output) as 16-bit mono PCM until it is finished or the
//! pipeline goes away.

use std::fs;
use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::sample_to_i16;
use crate::error::RecordingError;
use crate::graph::mix::MixDestination;

/// Recordings kept by `prune_recordings` by default.
pub const MAX_RECORDINGS: usize = 5;

/// What a finished recording contains.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub samples_written: u64,
    pub duration_secs: f64,
    /// Blocks lost because the writer fell behind
    pub blocks_skipped: u64,
}

pub struct MixRecorder {
    stop: CancellationToken,
    task: JoinHandle<Result<RecordingSummary, RecordingError>>,
}

impl MixRecorder {
    /// Create `path` and start recording the mix into it.
    pub fn start(mix: &MixDestination, path: &Path) -> Result<Self, RecordingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate: mix.sample_rate(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)?;
        let blocks = mix.subscribe();
        let stop = CancellationToken::new();

        log::info!("MixRecorder: recording to {:?}", path);

        let task = tokio::spawn(write_blocks(
            writer,
            blocks,
            stop.clone(),
            path.to_path_buf(),
            spec.sample_rate,
        ));

        Ok(Self { stop, task })
    }

    /// Stop recording and finalize the file.
    pub async fn finish(self) -> Result<RecordingSummary, RecordingError> {
        self.stop.cancel();
        self.task
            .await
            .map_err(|e| RecordingError::Task(e.to_string()))?
    }
}

async fn write_blocks(
    mut writer: WavWriter<std::io::BufWriter<fs::File>>,
    mut blocks: tokio::sync::broadcast::Receiver<std::sync::Arc<[f32]>>,
    stop: CancellationToken,
    path: PathBuf,
    sample_rate: u32,
) -> Result<RecordingSummary, RecordingError> {
    let mut samples_written = 0u64;
    let mut blocks_skipped = 0u64;

    loop {
        let block = tokio::select! {
            _ = stop.cancelled() => break,
            block = blocks.recv() => block,
        };
        match block {
            Ok(block) => {
                for &sample in block.iter() {
                    writer.write_sample(sample_to_i16(sample))?;
                }
                samples_written += block.len() as u64;
            }
            Err(RecvError::Lagged(skipped)) => {
                blocks_skipped += skipped;
                log::warn!("MixRecorder: fell behind, skipped {} blocks", skipped);
            }
            // Pipeline released
            Err(RecvError::Closed) => break,
        }
    }

    writer.finalize()?;

    let summary = RecordingSummary {
        path,
        samples_written,
        duration_secs: samples_written as f64 / sample_rate as f64,
        blocks_skipped,
    };
    log::info!(
        "MixRecorder: finalized {:?} ({:.1}s)",
        summary.path,
        summary.duration_secs
    );
    Ok(summary)
}

/// `<dir>/<YYYYmmdd_HHMMSS>_<session id>.wav`
pub fn recording_path_in(dir: &Path, session_id: Uuid) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}.wav", timestamp, session_id))
}

/// Delete the oldest `.wav` files in `dir`, keeping the newest `keep`.
pub fn prune_recordings(dir: &Path, keep: usize) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "wav"))
        .collect();

    if entries.len() <= keep {
        return Ok(0);
    }

    // Oldest first
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());

    let to_delete = entries.len() - keep;
    let mut deleted = 0;
    for entry in entries.into_iter().take(to_delete) {
        if fs::remove_file(entry.path()).is_ok() {
            log::debug!("MixRecorder: pruned {:?}", entry.path());
            deleted += 1;
        }
    }
    Ok(deleted)
}
