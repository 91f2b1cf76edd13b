//! Configuration types for streamgate.
//!
//! Config is loaded once at startup: an optional TOML file (path in the
//! `GATEWAY_CONFIG` env var) provides the tunables, then the deploy-time
//! environment variables override individual fields. The merged config is
//! validated before the server opens any ports; invalid configs are rejected
//! with a clear error rather than silently falling back to defaults.
//!
//! Secrets never live in the file: each provider entry names the environment
//! variable that holds its API key (`api_key_env`), and identity credentials
//! are read from `IDENTITY_CREDENTIALS_FILE` / `IDENTITY_CREDENTIALS_JSON` /
//! `IDENTITY_JWT_SECRET`.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [classifier]
//! url = "http://localhost:9090/classify"
//!
//! [providers.groq]
//! base_url = "https://api.groq.com/openai/v1"
//! api_key_env = "GROQ_API_KEY"
//! model = "llama-3.3-70b-versatile"
//!
//! [limits.anonymous]
//! requests_per_day = 10
//! ```

use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The closed set of upstream LLM providers.
///
/// Each variant maps to one streaming adapter in [`crate::providers`]; the
/// classifier names providers with the same lowercase strings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Gemini-style streaming (`:streamGenerateContent?alt=sse`).
    Gemini,
    /// OpenRouter — OpenAI-style SSE with a separate `reasoning` delta channel.
    #[serde(rename = "openrouter")]
    OpenRouter,
    /// Groq — plain OpenAI-style SSE.
    Groq,
    /// Local inference server speaking newline-delimited JSON.
    Local,
}

impl Provider {
    pub const ALL: [Provider; 4] = [Self::Gemini, Self::OpenRouter, Self::Groq, Self::Local];

    /// Prefix used for this provider's override environment variables
    /// (`<PREFIX>_API_KEY`, `<PREFIX>_API_BASE_URL`, `<PREFIX>_MODEL_NAME`).
    pub fn env_prefix(self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI",
            Self::OpenRouter => "OPENROUTER",
            Self::Groq => "GROQ",
            Self::Local => "LOCAL",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::Local => "local",
        })
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Circuit breaker wrapped around classifier calls.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Rate-limit policies per tier.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Upstream providers. Entries missing from the file get built-in
    /// defaults so a bare deployment only needs API keys in the environment.
    #[serde(default)]
    pub providers: HashMap<Provider, ProviderConfig>,

    /// Identity-provider credential sources.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Model used when the classifier responds without usable metadata.
    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl Config {
    /// Load the config file (if present), merge defaults and environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config: Self = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                toml::from_str(&content).context("parsing config TOML")?
            }
            None => Self::default(),
        };

        config.fill_provider_defaults();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Ensure every provider has an entry so env-only deployments work.
    fn fill_provider_defaults(&mut self) {
        for provider in Provider::ALL {
            self.providers
                .entry(provider)
                .or_insert_with(|| ProviderConfig::builtin(provider));
        }
    }

    /// Apply the deploy-time environment overrides.
    fn apply_env(&mut self) {
        if let Some(port) = env_var("PORT").and_then(|v| v.parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(url) = env_var("REDIS_URL") {
            self.gateway.redis_url = Some(url);
        }
        if let Some(url) = env_var("CLASSIFIER_URL") {
            self.classifier.url = url;
        }
        if let Some(prompt) = env_var("GLOBAL_SYSTEM_PROMPT") {
            self.gateway.system_prompt = prompt;
        }
        if let Some(level) = env_var("LOG_LEVEL") {
            self.gateway.log_level = Some(level);
        }
        if let Some(format) = env_var("LOG_FORMAT") {
            if let Ok(parsed) = format.parse() {
                self.gateway.log_format = parsed;
            }
        }
        if let Some(file) = env_var("IDENTITY_CREDENTIALS_FILE") {
            self.identity.credentials_file = Some(file.into());
        }
        if let Some(json) = env_var("IDENTITY_CREDENTIALS_JSON") {
            self.identity.credentials_json = Some(json);
        }

        for provider in Provider::ALL {
            let prefix = provider.env_prefix();
            let entry = self
                .providers
                .entry(provider)
                .or_insert_with(|| ProviderConfig::builtin(provider));
            if let Some(url) = env_var(&format!("{prefix}_API_BASE_URL")) {
                entry.base_url = url;
            }
            if let Some(model) = env_var(&format!("{prefix}_MODEL_NAME")) {
                entry.model = model;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gateway.port != 0, "gateway port must be non-zero");
        anyhow::ensure!(!self.classifier.url.is_empty(), "classifier URL is required");
        anyhow::ensure!(
            self.gateway.history_limit > 0,
            "history_limit must be at least 1"
        );
        anyhow::ensure!(
            self.breaker.failure_threshold > 0,
            "breaker failure_threshold must be at least 1"
        );
        anyhow::ensure!(
            self.breaker.half_open_max_calls > 0,
            "breaker half_open_max_calls must be at least 1"
        );

        for (name, tier) in [
            ("anonymous", &self.limits.anonymous),
            ("authenticated", &self.limits.authenticated),
        ] {
            anyhow::ensure!(
                tier.requests_per_day > 0 && tier.requests_per_minute > 0,
                "limits.{name} request caps must be non-zero"
            );
            anyhow::ensure!(
                tier.suspicious_threshold > 0,
                "limits.{name} suspicious_threshold must be non-zero"
            );
            anyhow::ensure!(
                tier.suspicious_window_secs > 0
                    && tier.block_duration_secs > 0
                    && tier.tracking_window_secs > 0,
                "limits.{name} windows must be non-zero"
            );
            anyhow::ensure!(
                tier.tracking_window_secs >= tier.suspicious_window_secs,
                "limits.{name} tracking_window must cover the suspicious_window"
            );
        }

        for (provider, cfg) in &self.providers {
            anyhow::ensure!(
                !cfg.base_url.is_empty() && !cfg.model.is_empty(),
                "provider `{provider}` needs a base_url and model"
            );
        }

        anyhow::ensure!(
            self.providers.contains_key(&self.fallback.provider),
            "fallback provider `{}` is not configured",
            self.fallback.provider
        );

        Ok(())
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(&provider)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Listen port (default: 8080, overridden by `PORT`).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log level override (also controlled by `RUST_LOG` / `LOG_LEVEL`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Log output format (`text` or `json`, overridden by `LOG_FORMAT`).
    #[serde(default)]
    pub log_format: LogFormat,

    /// System prompt prepended to every conversation
    /// (overridden by `GLOBAL_SYSTEM_PROMPT`).
    #[serde(default = "defaults::system_prompt")]
    pub system_prompt: String,

    /// How many non-thinking history entries are forwarded to providers.
    #[serde(default = "defaults::history_limit")]
    pub history_limit: usize,

    /// Accepted for deploy parity; counters are in-process, so when set the
    /// gateway only logs that shared limiter state is not enabled.
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty gateway config must deserialize")
    }
}

/// Log output format selector.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format `{other}` (expected text|json)"),
        }
    }
}

/// Classifier service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    /// Full URL of the model-ranking endpoint (overridden by `CLASSIFIER_URL`).
    #[serde(default)]
    pub url: String,

    /// Hard deadline for the classifier round-trip, in seconds (default: 25).
    /// The in-flight HTTP request is cancelled when it elapses.
    #[serde(default = "defaults::classifier_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty classifier config must deserialize")
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Circuit-breaker thresholds for classifier calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit open (default: 5).
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing again (default: 30).
    #[serde(default = "defaults::recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Concurrent probe calls admitted while half-open (default: 3).
    #[serde(default = "defaults::half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty breaker config must deserialize")
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Rate-limit policies, one per tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "defaults::anonymous_tier")]
    pub anonymous: TierLimits,
    #[serde(default = "defaults::authenticated_tier")]
    pub authenticated: TierLimits,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            anonymous: defaults::anonymous_tier(),
            authenticated: defaults::authenticated_tier(),
        }
    }
}

/// Rate-limit policy for one tier.
///
/// The suspicious-activity knobs are deliberately all configurable; both
/// "5 min window / 15 hits / 60 min block" and "1 min / 20 / 15 min" are
/// reasonable parameterisations depending on traffic shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierLimits {
    /// Daily request quota. With `hard_daily_cap` this is a hard deny;
    /// without it requests past the quota degrade to the free classification.
    pub requests_per_day: u32,
    /// Per-minute request cap (always a hard deny).
    pub requests_per_minute: u32,
    /// More than this many hits inside `suspicious_window_secs` triggers a block.
    pub suspicious_threshold: usize,
    pub suspicious_window_secs: u64,
    /// How long a suspicious key stays blocked.
    pub block_duration_secs: u64,
    /// How far back individual hit timestamps are retained.
    pub tracking_window_secs: u64,
    /// Sweep cadence for the bucket reaper.
    pub cleanup_interval_secs: u64,
    /// Buckets idle this long past their daily reset are reaped.
    pub cleanup_ttl_secs: u64,
    /// Deny outright once the daily quota is spent (anonymous tier).
    pub hard_daily_cap: bool,
}

impl TierLimits {
    pub fn suspicious_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.suspicious_window_secs as i64)
    }

    pub fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.block_duration_secs as i64)
    }

    pub fn tracking_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tracking_window_secs as i64)
    }

    pub fn cleanup_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cleanup_ttl_secs as i64)
    }
}

/// One upstream provider endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    pub base_url: String,

    /// Environment variable name whose value is the API key.
    ///
    /// Leave unset for keyless local backends.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model sent when the classifier does not name a provider-native model.
    pub model: String,
}

impl ProviderConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }

    /// Built-in endpoint defaults so env-only deployments need no file.
    fn builtin(provider: Provider) -> Self {
        let (base_url, api_key_env, model) = match provider {
            Provider::Gemini => (
                "https://generativelanguage.googleapis.com",
                Some("GEMINI_API_KEY"),
                "gemini-2.0-flash",
            ),
            Provider::OpenRouter => (
                "https://openrouter.ai/api/v1",
                Some("OPENROUTER_API_KEY"),
                "deepseek/deepseek-r1",
            ),
            Provider::Groq => (
                "https://api.groq.com/openai/v1",
                Some("GROQ_API_KEY"),
                "llama-3.3-70b-versatile",
            ),
            Provider::Local => ("http://localhost:11434", None, "llama3.1:8b"),
        };
        Self {
            base_url: base_url.to_owned(),
            api_key_env: api_key_env.map(str::to_owned),
            model: model.to_owned(),
        }
    }
}

/// Identity-provider credential sources, checked in declaration order.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Path to a service-account JSON file.
    #[serde(default)]
    pub credentials_file: Option<std::path::PathBuf>,

    /// Inline service-account JSON (container-secret friendly).
    #[serde(default)]
    pub credentials_json: Option<String>,
}

/// Candidate used when the classifier responds without model metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    #[serde(default = "defaults::fallback_provider")]
    pub provider: Provider,
    /// Display name surfaced in the SSE `start` event.
    #[serde(default = "defaults::fallback_display_name")]
    pub display_name: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            provider: defaults::fallback_provider(),
            display_name: defaults::fallback_display_name(),
        }
    }
}

mod defaults {
    use super::{Provider, TierLimits};

    pub fn port() -> u16 {
        8080
    }
    pub fn system_prompt() -> String {
        "You are a helpful assistant.".to_owned()
    }
    pub fn history_limit() -> usize {
        4
    }
    pub fn classifier_timeout_secs() -> u64 {
        25
    }
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn recovery_timeout_secs() -> u64 {
        30
    }
    pub fn half_open_max_calls() -> u32 {
        3
    }
    pub fn fallback_provider() -> Provider {
        Provider::Local
    }
    pub fn fallback_display_name() -> String {
        "Standard".to_owned()
    }

    pub fn anonymous_tier() -> TierLimits {
        TierLimits {
            requests_per_day: 10,
            requests_per_minute: 5,
            suspicious_threshold: 15,
            suspicious_window_secs: 300,
            block_duration_secs: 3_600,
            tracking_window_secs: 600,
            cleanup_interval_secs: 3_600,
            cleanup_ttl_secs: 86_400,
            hard_daily_cap: true,
        }
    }

    pub fn authenticated_tier() -> TierLimits {
        TierLimits {
            requests_per_day: 100,
            requests_per_minute: 20,
            suspicious_threshold: 15,
            suspicious_window_secs: 300,
            block_duration_secs: 3_600,
            tracking_window_secs: 600,
            cleanup_interval_secs: 3_600,
            cleanup_ttl_secs: 86_400,
            hard_daily_cap: false,
        }
    }
}
