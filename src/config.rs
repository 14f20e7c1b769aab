//! Configuration management for readaloud.
//!
//! Loads config from YAML files in standard locations. Every section
//! has defaults, so a missing or partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub native_chunk_chars: usize,
    pub remote_chunk_chars: usize,
    pub offline_chunk_chars: usize,
    pub demotion_threshold: u32,
    pub assumed_words_per_minute: f64,
    pub chars_per_word: f64,
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            native_chunk_chars: 900,
            remote_chunk_chars: 4500,
            offline_chunk_chars: 900,
            demotion_threshold: 2,
            assumed_words_per_minute: 180.0,
            chars_per_word: 5.0,
            tick_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Assumed characters per second at rate 1.0.
    pub fn assumed_chars_per_second(&self) -> f64 {
        self.assumed_words_per_minute * self.chars_per_word / 60.0
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub probe_timeouts_ms: Vec<u64>,
    pub reprobe_interval_secs: u64,
    pub default_voice: String,
    pub pitch: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://read-aloud-tts-api.onrender.com".into(),
            request_timeout_secs: 30,
            probe_timeouts_ms: vec![3000, 6000],
            reprobe_interval_secs: 300,
            default_voice: "en-US-AriaNeural".into(),
            pitch: "+0Hz".into(),
        }
    }
}

impl RemoteConfig {
    pub fn probe_timeouts(&self) -> Vec<Duration> {
        self.probe_timeouts_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub enabled: bool,
    pub socket_path: String,
    pub ready_timeout_ms: u64,
    pub excluded_voices: Vec<String>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: String::new(),
            ready_timeout_ms: 2000,
            excluded_voices: [
                "Jester", "Organ", "Bubbles", "Bad News", "Boing", "Wobble", "Grandma",
                "Grandpa", "Rocko", "Shelley", "Flo", "Eddy", "Reed",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl NativeConfig {
    /// Resolve the Speech Dispatcher socket.
    ///
    /// Order: explicit config, `SPEECHD_ADDRESS=unix_socket:<path>`,
    /// then the per-user runtime directory.
    pub fn resolve_socket(&self) -> Option<PathBuf> {
        if !self.socket_path.is_empty() {
            return Some(PathBuf::from(&self.socket_path));
        }
        if let Ok(address) = std::env::var("SPEECHD_ADDRESS") {
            if let Some(path) = address.strip_prefix("unix_socket:") {
                return Some(PathBuf::from(path));
            }
        }
        dirs::runtime_dir().map(|d| d.join("speech-dispatcher/speechd.sock"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub enabled: bool,
    pub program: String,
    pub default_voice: String,
    pub voices: Vec<String>,
    pub words_per_minute: f64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "espeak-ng".into(),
            default_voice: "en".into(),
            voices: ["en", "es", "fr", "de", "it"].into_iter().map(String::from).collect(),
            words_per_minute: 175.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8768 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub remote: RemoteConfig,
    pub native: NativeConfig,
    pub offline: OfflineConfig,
    pub api: ApiConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/readaloud/config.yaml
    /// 3. /etc/readaloud/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/readaloud/config.yaml")),
                Some(PathBuf::from("/etc/readaloud/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    /// Parse a YAML document and repair out-of-range values.
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        let mut config: Config = serde_yml::from_str(contents)?;
        config.sanitize();
        Ok(config)
    }

    /// Replace invalid values with defaults.
    pub fn sanitize(&mut self) {
        let defaults = EngineConfig::default();
        let engine = &mut self.engine;

        for (name, value, fallback) in [
            ("native_chunk_chars", &mut engine.native_chunk_chars, defaults.native_chunk_chars),
            ("remote_chunk_chars", &mut engine.remote_chunk_chars, defaults.remote_chunk_chars),
            ("offline_chunk_chars", &mut engine.offline_chunk_chars, defaults.offline_chunk_chars),
        ] {
            if *value == 0 {
                warn!("engine.{name} must be at least 1, using {fallback}");
                *value = fallback;
            }
        }

        if engine.demotion_threshold == 0 {
            warn!("engine.demotion_threshold must be at least 1, using 1");
            engine.demotion_threshold = 1;
        }
        if !(engine.assumed_words_per_minute > 0.0) {
            engine.assumed_words_per_minute = defaults.assumed_words_per_minute;
        }
        if !(engine.chars_per_word > 0.0) {
            engine.chars_per_word = defaults.chars_per_word;
        }
        // Ticks must arrive at 4 Hz or faster.
        engine.tick_interval_ms = engine.tick_interval_ms.clamp(10, 250);

        if self.remote.probe_timeouts_ms.is_empty() {
            self.remote.probe_timeouts_ms = RemoteConfig::default().probe_timeouts_ms;
        }
        if !(self.offline.words_per_minute > 0.0) {
            self.offline.words_per_minute = OfflineConfig::default().words_per_minute;
        }
    }
}
