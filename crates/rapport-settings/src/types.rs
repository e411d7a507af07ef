//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! partial settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RapportSettings {
    /// Reasoning provider connection and resilience settings.
    pub provider: ProviderSettings,
    /// Usage store location.
    pub store: StoreSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Reasoning provider settings.
///
/// The API key is never read from or written to the settings file; it only
/// comes from the environment (see [`crate::loader::apply_env_overrides`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Set to `false` to always use the local heuristic analyzer.
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Upper bound for one analysis call, retries included.
    pub timeout_ms: u64,
    /// Retries after the first attempt for retryable errors.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Consecutive failures that open the circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// How long the circuit stays open before a trial request.
    pub circuit_breaker_cooldown_ms: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 30_000,
            max_retries: 1,
            base_delay_ms: 500,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_ms: 60_000,
            api_key: None,
        }
    }
}

impl ProviderSettings {
    /// A provider is configured when it is enabled and has credentials.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Usage store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Path to the SQLite usage database. `:memory:` keeps usage in-process.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: crate::loader::rapport_dir()
                .join("usage.db")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
