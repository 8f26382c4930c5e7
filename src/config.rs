use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL_NAME: &str = "llava";
pub const DEFAULT_PROMPT: &str = "Describe this image in detail. Be specific about the objects, \
     people, places, colors and atmosphere it contains.";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const MIN_TIMEOUT_SECONDS: u64 = 30;
pub const MAX_TIMEOUT_SECONDS: u64 = 600;

pub const DEFAULT_CONCURRENCY_LEVEL: usize = 1;
pub const MIN_CONCURRENCY_LEVEL: usize = 1;
pub const MAX_CONCURRENCY_LEVEL: usize = 5;

/// Output format used when batch results are written to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    #[default]
    Json,
    Csv,
    Txt,
}

impl SaveFormat {
    /// File extension (without the dot) for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Json => "json",
            SaveFormat::Csv => "csv",
            SaveFormat::Txt => "txt",
        }
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SaveFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SaveFormat::Json),
            "csv" => Ok(SaveFormat::Csv),
            "txt" | "text" => Ok(SaveFormat::Txt),
            other => Err(format!("unknown save format '{other}', expected json, csv or txt")),
        }
    }
}

/// Connection and behavior parameters for the captioning client.
///
/// A `Config` is owned by the application entry point and handed to
/// [`crate::InferenceClient::new`]; the client keeps its own copy, so a
/// changed configuration takes effect only through a freshly built client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub model_name: String,
    pub prompt: String,
    pub timeout_seconds: u64,
    pub concurrency_level: usize,
    pub save_results: bool,
    pub save_format: SaveFormat,
    pub include_timestamp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            save_results: false,
            save_format: SaveFormat::Json,
            include_timestamp: true,
        }
    }
}

impl Config {
    /// Replaces blank strings with their defaults and clamps the numeric
    /// fields into range. Applying it more than once changes nothing.
    pub fn validate(&mut self) {
        if self.server_url.trim().is_empty() {
            self.server_url = DEFAULT_SERVER_URL.to_string();
        }
        if self.model_name.trim().is_empty() {
            self.model_name = DEFAULT_MODEL_NAME.to_string();
        }
        if self.prompt.trim().is_empty() {
            self.prompt = DEFAULT_PROMPT.to_string();
        }

        self.timeout_seconds = self
            .timeout_seconds
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
        self.concurrency_level = self
            .concurrency_level
            .clamp(MIN_CONCURRENCY_LEVEL, MAX_CONCURRENCY_LEVEL);
    }

    /// By-value form of [`Config::validate`].
    pub fn validated(mut self) -> Self {
        self.validate();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// `<config dir>/kornia-captioner/settings.json`, if the platform has a
    /// config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kornia-captioner").join("settings.json"))
    }

    /// Reads a settings file. Fields missing from the file take their
    /// default values; the result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&json)?;
        Ok(config.validated())
    }

    /// Like [`Config::load`] but never fails: a missing or unreadable file
    /// yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::debug!("No settings file at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load settings from {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Writes the settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }
}
