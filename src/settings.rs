use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::codec::CodecKind;
use crate::error::SettingsError;

const SETTINGS_DIR_NAME: &str = "duplex-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub audio: AudioSettings,
    pub session: SessionSettings,
}

/// Tunables for the audio pipeline.
///
/// The encoder rate, frame size and channel count are fixed constants in
/// `capture` and intentionally not configurable here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Codec used on the wire in both directions.
    pub codec: CodecKind,

    /// Microphone → 24 kHz resampling quality (0 = fastest, 10 = best).
    pub encoder_resample_quality: u8,

    /// 24 kHz → playback rate resampling quality.
    pub decoder_resample_quality: u8,

    /// Analyser transform size (power of two).
    pub fft_size: usize,

    /// Time constant for volume changes, in seconds.
    pub volume_time_constant_secs: f64,

    /// Gain applied when a pipeline is first built.
    pub initial_volume: f32,

    /// Name of the playback worklet unit.
    pub worklet_unit: String,

    /// Prefix for worklet module paths (`{asset_root}/{unit}.js`).
    pub asset_root: String,

    /// Upper bound on loading a worklet module.
    pub unit_load_timeout_ms: u64,

    /// Audio the jitter buffer holds before starting (or resuming after an underrun).
    pub jitter_initial_buffer_ms: u32,

    /// Jitter buffer bound; the oldest audio is dropped beyond this.
    pub jitter_max_buffer_ms: u32,

    /// When set, the mix destination is recorded to this WAV file.
    pub record_path: Option<PathBuf>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: CodecKind::Opus,
            encoder_resample_quality: 10,
            decoder_resample_quality: 0,
            fft_size: 2048,
            volume_time_constant_secs: 0.01,
            initial_volume: 1.0,
            worklet_unit: "audio-output-processor".to_string(),
            asset_root: String::new(),
            unit_load_timeout_ms: 5000,
            jitter_initial_buffer_ms: 80,
            jitter_max_buffer_ms: 4000,
            record_path: None,
        }
    }
}

/// Where the realtime endpoint lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Talk to a locally running AI instead of reserving a pool endpoint.
    pub local_ai: bool,

    pub local_url: String,

    /// Base URL of the compute pool manager (`/register`, `/unregister`).
    pub pool_manager_url: String,

    pub proxy_host: String,

    pub endpoint_port: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            local_ai: false,
            local_url: "ws://localhost:8000".to_string(),
            pool_manager_url: "http://localhost:3001".to_string(),
            proxy_host: "proxy.runpod.net".to_string(),
            endpoint_port: 8000,
        }
    }
}

/// Default settings location: `<config dir>/duplex-voice/settings.json`.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(SETTINGS_DIR_NAME)
        .join(SETTINGS_FILE_NAME)
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

/// Persist `settings` as pretty JSON. Readers see either the old file or
/// the new one, never a partial write.
pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let json = serde_json::to_vec_pretty(settings)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let io_err = |source: std::io::Error| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut staged = NamedTempFile::new_in(dir).map_err(io_err)?;
    staged.write_all(&json).map_err(io_err)?;
    staged.as_file().sync_all().map_err(io_err)?;
    staged.persist(path).map_err(|e| io_err(e.error))?;

    log::debug!("Settings saved to {:?}", path);
    Ok(())
}

/// Apply environment overrides (`LOCALHOST_AI`, `POOL_MANAGER_URL`,
/// `PROXY_HOST`, `DUPLEX_RECORD_PATH`) on top of file settings.
pub fn apply_env_overrides(settings: &mut AppSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

fn apply_overrides_from(settings: &mut AppSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(flag) = lookup("LOCALHOST_AI") {
        settings.session.local_ai = flag == "true";
    }
    if let Some(url) = lookup("POOL_MANAGER_URL").filter(|v| !v.is_empty()) {
        settings.session.pool_manager_url = url;
    }
    if let Some(host) = lookup("PROXY_HOST").filter(|v| !v.is_empty()) {
        settings.session.proxy_host = host;
    }
    if let Some(path) = lookup("DUPLEX_RECORD_PATH").filter(|v| !v.is_empty()) {
        settings.audio.record_path = Some(PathBuf::from(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let settings = AudioSettings::default();
        assert_eq!(settings.fft_size, 2048);
        assert_eq!(settings.volume_time_constant_secs, 0.01);
        assert_eq!(settings.encoder_resample_quality, 10);
        assert_eq!(settings.decoder_resample_quality, 0);
        assert_eq!(settings.worklet_unit, "audio-output-processor");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.audio.codec = CodecKind::Pcm16;
        settings.session.local_ai = true;
        save_settings(&path, &settings).unwrap();

        assert_eq!(load_settings(&path), settings);
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1, "staging file left next to settings");
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut settings = AppSettings::default();
        settings.audio.initial_volume = 0.25;
        save_settings(&path, &settings).unwrap();

        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn test_save_into_file_parent_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let err = save_settings(&blocker.join("settings.json"), &AppSettings::default()).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "audio": { "initial_volume": 0.5 } }"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.audio.initial_volume, 0.5);
        assert_eq!(settings.audio.fft_size, 2048);
        assert_eq!(settings.session, SessionSettings::default());
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LOCALHOST_AI", "true"),
            ("PROXY_HOST", "proxy.example.net"),
            ("POOL_MANAGER_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut settings = AppSettings::default();
        apply_overrides_from(&mut settings, |k| env.get(k).map(|v| v.to_string()));

        assert!(settings.session.local_ai);
        assert_eq!(settings.session.proxy_host, "proxy.example.net");
        // Empty values leave the file setting alone
        assert_eq!(
            settings.session.pool_manager_url,
            SessionSettings::default().pool_manager_url
        );
    }
}
