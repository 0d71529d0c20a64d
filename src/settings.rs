use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CAPTURE_BLOCK_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::streaming::{ConnectOptions, SetupConfig};

const APP_DIR_NAME: &str = "astra-live";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Astra, a warm and curious voice companion. \
Keep answers short and conversational, ask a follow-up question when it helps, \
and never read out markdown or lists.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Remote model selected in the setup message.
    pub model: String,

    /// Persona given to the model. Empty means none.
    pub system_instruction: String,

    /// Prebuilt voice for synthesized speech; service default when unset.
    pub voice_name: Option<String>,

    /// Rate of outbound microphone chunks.
    pub input_sample_rate: u32,

    /// Rate assumed for inbound speech when the MIME descriptor carries none.
    pub output_sample_rate: u32,

    /// Samples per outbound microphone chunk.
    pub capture_block_size: usize,

    /// How long Disconnected is shown before returning to Idle.
    pub cooldown_ms: u64,

    /// Upper bound on the graceful close handshake.
    pub close_timeout_ms: u64,

    pub connect_timeout_ms: u64,
    pub setup_timeout_ms: u64,

    /// Total connection attempts, first try included.
    pub connect_attempts: u32,

    /// First retry delay; doubles per attempt.
    pub retry_base_delay_ms: u64,

    /// Outbound chunks allowed in flight before capture starts dropping blocks.
    pub outbound_queue_depth: usize,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice_name: None,
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_block_size: CAPTURE_BLOCK_SIZE,
            cooldown_ms: 1000,
            close_timeout_ms: 2000,
            connect_timeout_ms: 10_000,
            setup_timeout_ms: 5_000,
            connect_attempts: 3,
            retry_base_delay_ms: 1000,
            outbound_queue_depth: 8,
        }
    }
}

impl LiveSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Setup message sent when the session opens
    pub fn setup_config(&self) -> SetupConfig {
        let instruction = Some(self.system_instruction.trim()).filter(|s| !s.is_empty());
        SetupConfig::audio_session(&self.model, instruction, self.voice_name.as_deref())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
            max_attempts: self.connect_attempts.max(1),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            outbound_capacity: self.outbound_queue_depth.max(1),
        }
    }
}

/// `<config_dir>/astra-live/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> LiveSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            LiveSettings::default()
        }
    }
}

/// Missing file means defaults; a malformed file is logged and also gives defaults
pub fn load_settings_from(path: &Path) -> LiveSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<LiveSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                LiveSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LiveSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            LiveSettings::default()
        }
    }
}

pub fn save_settings(settings: &LiveSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &LiveSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the destination.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
