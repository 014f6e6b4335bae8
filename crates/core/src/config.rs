use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ENGINES: usize = 2;
pub const DEFAULT_RENT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid OCR configuration: {0}")]
    Invalid(String),
}

/// Settings for the recognition engine pool. Loaded once at startup and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Directory holding the engine's trained language data.
    pub tessdata_path: PathBuf,
    /// Language set in engine syntax, e.g. `eng+vie`.
    pub languages: String,
    /// Upper bound on engines constructed and checked out at once.
    pub max_engines: usize,
    /// How long `acquire` waits for a free engine.
    pub rent_timeout_ms: u64,
    /// Run the full normalization pipeline (orientation, contrast, deskew,
    /// threshold) instead of grayscale + upscale only.
    pub enable_preprocessing: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tessdata_path: PathBuf::from("tessdata"),
            languages: "eng+vie".to_string(),
            max_engines: DEFAULT_MAX_ENGINES,
            rent_timeout_ms: DEFAULT_RENT_TIMEOUT_MS,
            enable_preprocessing: true,
        }
    }
}

impl OcrConfig {
    /// Parse a TOML document. Settings may sit under an `[ocr]` table or at
    /// the top level.
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml::from_str(toml_content)?;
        let config: OcrConfig = match table.remove("ocr") {
            Some(section) => section.try_into()?,
            None => toml::Value::Table(table).try_into()?,
        };
        config.validated()
    }

    /// Read and parse a config file. A relative `tessdata_path` is resolved
    /// against the directory containing the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        if config.tessdata_path.is_relative() {
            if let Some(dir) = path.parent() {
                config.tessdata_path = dir.join(&config.tessdata_path);
            }
        }
        Ok(config)
    }

    /// Clamp out-of-range values to usable ones and reject what cannot be fixed.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.max_engines = self.max_engines.max(1);
        if self.rent_timeout_ms == 0 {
            self.rent_timeout_ms = DEFAULT_RENT_TIMEOUT_MS;
        }
        if self.languages.trim().is_empty() {
            return Err(ConfigError::Invalid("language set must not be empty".into()));
        }
        Ok(self)
    }

    pub fn rent_timeout(&self) -> Duration {
        Duration::from_millis(self.rent_timeout_ms)
    }
}
