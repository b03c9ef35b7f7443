//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use stepline_core::{BackoffPolicy, ExtractionSettings, Watermark};
use stepline_github::{DEFAULT_API_URL, GithubSettings};

/// Global configuration for stepline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub github: GithubConfig,
    pub extract: ExtractConfig,
    pub retry: RetryConfig,
    pub http: HttpConfig,
    pub output: OutputConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub token: Option<String>,
    pub owner: String,
    pub repo: String,
    pub user_agent: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: std::env::var("GITHUB_TOKEN").ok(),
            owner: String::new(),
            repo: String::new(),
            user_agent: concat!("stepline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl std::fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubConfig")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub step_size: u32,
    pub per_page: u32,
    /// Starting watermark when no state file exists
    pub default_since: String,
    pub max_consecutive_failed_batches: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            step_size: 3,
            per_page: 100,
            default_since: "2024-01-01T00:00:00Z".to_string(),
            max_consecutive_failed_batches: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_ms: u64,
    /// Longest wait honoured from `retry-after` / rate-limit reset headers
    pub max_hint_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 32_000,
            max_attempts: 5,
            jitter_ms: 1000,
            max_hint_ms: 900_000,
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout: u64,
    pub read_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            read_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Subdirectory (key prefix) for batch artifacts
    pub prefix: String,
    /// Watermark file; relative paths resolve against `dir`
    pub state_file: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            prefix: "data".to_string(),
            state_file: PathBuf::from("issue_state.json"),
        }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./stepline.toml (current directory)
    /// 2. ~/.config/stepline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("stepline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "stepline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn github_settings(&self) -> GithubSettings {
        GithubSettings {
            api_url: self.github.api_url.clone(),
            token: self.github.token.clone().unwrap_or_default(),
            owner: self.github.owner.clone(),
            repo: self.github.repo.clone(),
            user_agent: self.github.user_agent.clone(),
            http: stepline_core::HttpConfig {
                connect_timeout: Duration::from_secs(self.http.connect_timeout),
                read_timeout: Duration::from_secs(self.http.read_timeout),
            },
        }
    }

    pub fn extraction_settings(&self, max_batches: Option<u32>) -> ExtractionSettings {
        ExtractionSettings {
            step_size: self.extract.step_size,
            per_page: self.extract.per_page,
            default_since: Watermark::new(self.extract.default_since.clone()),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                max_attempts: self.retry.max_attempts,
                jitter: Duration::from_millis(self.retry.jitter_ms),
                max_hint: Duration::from_millis(self.retry.max_hint_ms),
            },
            max_batches,
            max_consecutive_failed_batches: self.extract.max_consecutive_failed_batches,
        }
    }

    /// Resolved watermark file path
    pub fn state_path(&self) -> PathBuf {
        if self.output.state_file.is_absolute() {
            self.output.state_file.clone()
        } else {
            self.output.dir.join(&self.output.state_file)
        }
    }

    /// Directory holding batch artifacts
    pub fn artifact_dir(&self) -> PathBuf {
        self.output.dir.join(&self.output.prefix)
    }
}
