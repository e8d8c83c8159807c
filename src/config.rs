use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "DEEPSEEK_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub llm: LLMConfig,
    pub sharding: ShardingConfig,
    pub dispatch: DispatchConfig,
    pub fusion: FusionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Size budget of a shard, in estimated tokens.
    pub max_shard_tokens: usize,
    /// Token estimate charged per non-empty source line.
    pub tokens_per_line: usize,
    /// Characters of a dependency's source kept in a shard's context entry.
    pub context_summary_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_concurrent_requests: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub collect_timeout_seconds: u64,
    pub retry_times: usize,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub similarity_threshold: f64,
    pub weights: ConfidenceWeights,
}

/// Weights of the three overall-confidence factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub success_rate: f64,
    pub finding_confidence: f64,
    pub consistency: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            llm: LLMConfig::default(),
            sharding: ShardingConfig::default(),
            dispatch: DispatchConfig::default(),
            fusion: FusionConfig::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.deepseek.com/v1".to_string(),
            api_key: None,
            model: "deepseek-r1".to_string(),
            max_tokens: 32000,
            temperature: 0.1,
            timeout_seconds: 300,
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            max_shard_tokens: 1500 * 18,
            tokens_per_line: 18,
            context_summary_chars: 200,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 20,
            batch_size: 16,
            batch_delay_ms: 2000,
            collect_timeout_seconds: 600,
            retry_times: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            weights: ConfidenceWeights::default(),
        }
    }
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            success_rate: 0.4,
            finding_confidence: 0.4,
            consistency: 0.2,
        }
    }
}

impl DispatchConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Config {
    /// Get the default config file path (~/.plc-examer.toml)
    pub fn default_config_path() -> crate::Result<PathBuf> {
        let home_dir = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .map_err(|_| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(PathBuf::from(home_dir).join(".plc-examer.toml"))
    }

    /// Load config from the given path, or from the default location, falling back to defaults.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_config_path()?;
                if default_path.exists() {
                    info!("Loading configuration from {}", default_path.display());
                    Self::from_file(&default_path)?
                } else {
                    debug!("No config file at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };

        config.resolve_api_key();
        Ok(config)
    }

    /// Load config from a specific file path
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to a file
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Expands `${VAR}` references in the API key and falls back to `DEEPSEEK_API_KEY`.
    fn resolve_api_key(&mut self) {
        self.llm.api_key = match self.llm.api_key.take() {
            Some(value) => match value
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(var) => env::var(var).ok(),
                None => Some(value),
            },
            None => None,
        }
        .filter(|key| !key.trim().is_empty())
        .or_else(|| env::var(API_KEY_ENV).ok().filter(|key| !key.trim().is_empty()));
    }

    /// Returns every configuration problem found; empty when the config is usable.
    pub fn validate(&self, require_api_key: bool) -> Vec<String> {
        let mut errors = Vec::new();

        if require_api_key && self.llm.api_key.is_none() {
            errors.push(format!("{} environment variable or llm.api_key is required", API_KEY_ENV));
        }
        if self.sharding.max_shard_tokens == 0 {
            errors.push("sharding.max_shard_tokens must be positive".to_string());
        }
        if self.dispatch.max_concurrent_requests == 0 {
            errors.push("dispatch.max_concurrent_requests must be positive".to_string());
        }
        if self.dispatch.batch_size == 0 {
            errors.push("dispatch.batch_size must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.fusion.similarity_threshold) {
            errors.push("fusion.similarity_threshold must be within [0, 1]".to_string());
        }
        let weights = &self.fusion.weights;
        if [weights.success_rate, weights.finding_confidence, weights.consistency]
            .iter()
            .any(|w| !w.is_finite() || *w <= 0.0)
        {
            errors.push("fusion.weights must all be positive".to_string());
        }

        errors
    }

    /// Create a config file with all available options documented
    pub fn create_documented_config() -> String {
        r#"# PLC Examer Configuration File

[app]
# Log level used when RUST_LOG is not set (error, warn, info, debug, trace)
log_level = "info"

[llm]
# OpenAI-compatible endpoint of the reasoning service
api_base = "https://api.deepseek.com/v1"

# API key; "${VAR}" reads the named environment variable.
# When omitted, DEEPSEEK_API_KEY is used.
# api_key = "${DEEPSEEK_API_KEY}"

model = "deepseek-r1"
max_tokens = 32000
temperature = 0.1

# Per-request timeout in seconds
timeout_seconds = 300

[sharding]
# Shard size budget in estimated tokens (1500 lines * 18 tokens per line)
max_shard_tokens = 27000
tokens_per_line = 18

# Characters of each dependency kept as context for a shard
context_summary_chars = 200

[dispatch]
# Maximum number of reasoning calls in flight at once
max_concurrent_requests = 20

# Shards submitted per batch, and the pause between batches
batch_size = 16
batch_delay_ms = 2000

# Deadline for collecting one batch; unfinished shards are recorded as timed out
collect_timeout_seconds = 600

# Attempts per shard for transient failures; delay grows linearly per attempt
retry_times = 3
retry_delay_ms = 2000

[fusion]
# Findings merge when their similarity score exceeds this threshold
similarity_threshold = 0.8

[fusion.weights]
success_rate = 0.4
finding_confidence = 0.4
consistency = 0.2
"#
        .to_string()
    }
}
