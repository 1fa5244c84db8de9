//! Configuration system (layered: defaults < TOML file < environment).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WeftError;
use crate::stream_transform::DEFAULT_MAX_TAG_LEN;
use crate::util::retry::RetryPolicy;

/// Global default config (lazy-initialized from file and env).
static DEFAULT_CONFIG: OnceLock<WeftConfig> = OnceLock::new();

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "WEFT_CONFIG";

/// Environment overrides and the config keys they set.
const ENV_MAPPINGS: [(&str, &str); 7] = [
    ("WEFT_MAX_AGENT_STEPS", "max_agent_steps"),
    ("WEFT_RETRY_MAX_RETRIES", "retry.max_retries"),
    ("WEFT_RETRY_BASE_DELAY_MS", "retry.base_delay_ms"),
    ("WEFT_RETRY_MAX_DELAY_MS", "retry.max_delay_ms"),
    ("WEFT_BEST_OF_N_MIN", "best_of_n.min"),
    ("WEFT_BEST_OF_N_MAX", "best_of_n.max"),
    ("WEFT_EXTRACTOR_MAX_TAG_LEN", "extractor.max_tag_len"),
];

/// Layered configuration for weft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    /// Step budget for a fresh agent.
    pub max_agent_steps: u32,
    pub retry: RetryConfig,
    pub best_of_n: BestOfNConfig,
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BestOfNConfig {
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub max_tag_len: usize,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            max_agent_steps: 20,
            retry: RetryConfig::default(),
            best_of_n: BestOfNConfig::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for BestOfNConfig {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

impl BestOfNConfig {
    pub fn range(&self) -> std::ops::RangeInclusive<usize> {
        self.min..=self.max
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_tag_len: DEFAULT_MAX_TAG_LEN,
        }
    }
}

impl WeftConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, WeftError> {
        let config: Self = toml::from_str(source)
            .map_err(|e| WeftError::Configuration(format!("invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, WeftError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            WeftError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// `~/.weft/config.toml`.
    pub fn default_path() -> PathBuf {
        directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().join(".weft"))
            .unwrap_or_else(|| PathBuf::from(".weft"))
            .join("config.toml")
    }

    /// Load defaults, then the config file (`WEFT_CONFIG` or the default
    /// path, if present), then `WEFT_*` environment overrides. A `.env` file
    /// is loaded first when present.
    pub fn load() -> Result<Self, WeftError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Get (or create) the global default config.
    ///
    /// Falls back to defaults when loading fails.
    pub fn global() -> &'static WeftConfig {
        DEFAULT_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to default config");
                Self::default()
            })
        })
    }

    /// Apply `WEFT_*` overrides from the given variables.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), WeftError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some((_, key)) = ENV_MAPPINGS.iter().find(|(var, _)| *var == name) {
                self.set(key, &value)?;
            }
        }
        self.validate()
    }

    /// Set one dotted config key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), WeftError> {
        match key {
            "max_agent_steps" => self.max_agent_steps = parse(key, value)?,
            "retry.max_retries" => self.retry.max_retries = parse(key, value)?,
            "retry.base_delay_ms" => self.retry.base_delay_ms = parse(key, value)?,
            "retry.max_delay_ms" => self.retry.max_delay_ms = parse(key, value)?,
            "best_of_n.min" => self.best_of_n.min = parse(key, value)?,
            "best_of_n.max" => self.best_of_n.max = parse(key, value)?,
            "extractor.max_tag_len" => self.extractor.max_tag_len = parse(key, value)?,
            other => {
                return Err(WeftError::Configuration(format!(
                    "unknown config key '{other}'"
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WeftError> {
        if self.max_agent_steps == 0 {
            return Err(WeftError::Configuration(
                "max_agent_steps must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(WeftError::Configuration(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.best_of_n.min == 0 || self.best_of_n.min > self.best_of_n.max {
            return Err(WeftError::Configuration(format!(
                "invalid best_of_n range {}..={}",
                self.best_of_n.min, self.best_of_n.max
            )));
        }
        if self.extractor.max_tag_len < 8 {
            return Err(WeftError::Configuration(
                "extractor.max_tag_len must be at least 8".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WeftError> {
    value.trim().parse().map_err(|_| {
        WeftError::Configuration(format!("invalid value '{value}' for {key}"))
    })
}
