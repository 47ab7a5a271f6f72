//! Configuration management for chat-speaker.
//!
//! Loads config from YAML files in standard locations; every section and
//! field falls back to its default when absent.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::speaker::chunker::ChunkerOptions;
use crate::speaker::orchestrator::OrchestratorConfig;
use crate::speaker::synth::VoiceConfig;
use crate::speaker::tokens::DEFAULT_MAX_BUFFER;

/// Directory name under the user and system config roots
const APP_DIR: &str = "chat-speaker";
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Base URL of the synthesis service
    pub endpoint: String,
    pub provider_id: String,
    pub voice_id: String,
    pub voice_metadata: Value,
    pub pitch: f32,
    pub rate: f32,
    pub ssml_enabled: bool,
    pub provider_config: Map<String, Value>,
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000".into(),
            provider_id: String::new(),
            voice_id: String::new(),
            voice_metadata: Value::Null,
            pitch: 0.0,
            rate: 1.0,
            ssml_enabled: false,
            provider_config: Map::new(),
            timeout_secs: 30,
        }
    }
}

impl SpeechConfig {
    pub fn voice(&self) -> VoiceConfig {
        VoiceConfig {
            provider_id: self.provider_id.clone(),
            voice_id: self.voice_id.clone(),
            voice_metadata: self.voice_metadata.clone(),
            pitch: self.pitch,
            rate: self.rate,
            ssml_enabled: self.ssml_enabled,
            provider_config: self.provider_config.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub max_buffer: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Play through the default output device; otherwise only log
    pub audio_output: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { audio_output: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub speech: SpeechConfig,
    pub chunker: ChunkerOptions,
    pub tokenizer: TokenizerConfig,
    pub playback: PlaybackConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Locations searched, in order, when no path is given.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(dir) = std::env::current_dir() {
            paths.push(dir.join(CONFIG_FILE));
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(APP_DIR).join(CONFIG_FILE));
        }
        paths.push(Path::new("/etc").join(APP_DIR).join(CONFIG_FILE));
        paths
    }

    /// Load `path`, or the first existing file from [`search_paths`](Self::search_paths).
    /// Unreadable or malformed files are logged and replaced by defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::search_paths().into_iter().find(|p| p.exists()),
        };
        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match Self::read(&config_path) {
            Ok(config) => {
                info!("Loaded config from {}", config_path.display());
                config
            }
            Err(e) => {
                warn!("{e}, using defaults");
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        serde_yml::from_str(&contents).map_err(|e| format!("Failed to parse {}: {e}", path.display()))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            voice: self.speech.voice(),
            chunker: self.chunker,
            max_buffer: self.tokenizer.max_buffer,
        }
    }
}
