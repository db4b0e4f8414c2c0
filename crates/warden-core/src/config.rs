use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Top-level configuration loaded from `.warden.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use warden_core::WardenConfig;
///
/// let config = WardenConfig::default();
/// assert_eq!(config.pipeline.max_attempts, 3);
/// assert_eq!(config.review.max_input_chars, 12000);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Identity used when several identities selected the same repository.
    pub default_identity: Option<String>,
    /// Webhook listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Source-host API settings.
    #[serde(default)]
    pub github: GitHubConfig,
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Review input/output bounds.
    #[serde(default)]
    pub review: ReviewConfig,
    /// Worker pool and retry settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Storage settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl WardenConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Io`] if the file cannot be read, or
    /// [`WardenError::Toml`] if the content is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self, WardenError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::WardenConfig;
    ///
    /// let toml = r#"
    /// [pipeline]
    /// workers = 8
    /// "#;
    /// let config = WardenConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.pipeline.workers, 8);
    /// assert_eq!(config.pipeline.per_repository_limit, 2);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, WardenError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from environment variables.
    ///
    /// Reads `GITHUB_WEBHOOK_SECRET`, `WARDEN_PUBLIC_URL`, `OPENAI_API_KEY`,
    /// `WARDEN_DB` and `WARDEN_BIND`. Unset or empty variables leave the file
    /// value untouched.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(secret) = get("GITHUB_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        if let Some(url) = get("WARDEN_PUBLIC_URL") {
            self.server.public_url = Some(url);
        }
        if let Some(bind) = get("WARDEN_BIND") {
            self.server.bind = bind;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(path) = get("WARDEN_DB") {
            self.store.path = PathBuf::from(path);
        }
    }

    fn validate(&self) -> Result<(), WardenError> {
        if self.pipeline.workers == 0 {
            return Err(WardenError::Config("pipeline.workers must be at least 1".into()));
        }
        if self.pipeline.per_repository_limit == 0 {
            return Err(WardenError::Config(
                "pipeline.per_repository_limit must be at least 1".into(),
            ));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(WardenError::Config(
                "pipeline.max_attempts must be at least 1".into(),
            ));
        }
        if self.review.max_input_chars == 0 || self.review.max_output_chars == 0 {
            return Err(WardenError::Config(
                "review character budgets must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Webhook listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on (default: `0.0.0.0:3000`).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret for `X-Hub-Signature-256` verification.
    pub webhook_secret: Option<String>,
    /// Externally reachable base URL, used as the webhook callback.
    pub public_url: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:3000".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_secret: None,
            public_url: None,
        }
    }
}

/// Source-host (GitHub) API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// REST API base URL (default: `https://api.github.com`).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// `User-Agent` header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.github.com".into()
}

fn default_user_agent() -> String {
    "warden".into()
}

fn default_github_timeout() -> u64 {
    30
}

impl GitHubConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_github_timeout(),
        }
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use warden_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o-mini");
/// assert_eq!(config.timeout_secs, 60);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (e.g. `"openai"`, `"ollama"`).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Maximum tokens the model may produce per review (default: 1024).
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Fixed generation timeout in seconds (default: 60).
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Sampling temperature (default: 0.2).
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_temperature() -> f32 {
    0.2
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
        }
    }
}

/// Review input and output bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Character budget for the diff sent to the generator (default: 12000).
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Maximum length of a posted review in characters (default: 4000).
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_max_input_chars() -> usize {
    12_000
}

fn default_max_output_chars() -> usize {
    4_000
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_input_chars: default_max_input_chars(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

/// Worker pool, concurrency and retry configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_core::PipelineConfig;
///
/// let config = PipelineConfig::default();
/// assert_eq!(config.workers, 4);
/// assert_eq!(config.base_backoff(), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent workers (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum in-flight jobs per repository (default: 2).
    #[serde(default = "default_per_repository_limit")]
    pub per_repository_limit: usize,
    /// Attempts per stage before the job fails (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds (default: 500).
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound on a computed backoff delay in milliseconds (default: 30000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Timeout applied to each stage attempt in seconds (default: 120).
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_per_repository_limit() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_stage_timeout() -> u64 {
    120
}

impl PipelineConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            per_repository_limit: default_per_repository_limit(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (default: `.warden/warden.db`).
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Days to keep finished ledger entries. Absent means forever.
    pub ledger_retention_days: Option<u64>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".warden/warden.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            ledger_retention_days: None,
        }
    }
}
