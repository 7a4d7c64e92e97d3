//! Configuration management for the run transport.
//!
//! Loads configuration from a TOML file with sensible defaults. The backend
//! base URL can be overridden with `RUNWIRE_BASE_URL`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::reconcile::ReconcileOptions;

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "RUNWIRE_BASE_URL";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend origin, e.g. `https://chat.example.com`
    pub base_url: String,

    /// Name of the cookie the backend sets alongside the CSRF bootstrap
    pub csrf_cookie_name: String,

    /// Re-bootstrap and retry once when a request is rejected with E2002
    pub retry_on_csrf_rejection: bool,

    /// Timeout for non-streaming requests in milliseconds (0 disables)
    pub request_timeout_ms: u64,

    /// Maximum silence between stream events in milliseconds (0 disables)
    pub stream_idle_timeout_ms: u64,

    /// How long an unconfirmed pending message stays visible, in milliseconds
    pub pending_window_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            csrf_cookie_name: Self::DEFAULT_CSRF_COOKIE.to_string(),
            retry_on_csrf_rejection: true,
            request_timeout_ms: Self::DEFAULT_REQUEST_TIMEOUT_MS,
            stream_idle_timeout_ms: 0,
            pending_window_ms: Self::DEFAULT_PENDING_WINDOW_MS,
        }
    }
}

impl Config {
    const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
    const DEFAULT_CSRF_COOKIE: &str = "csrf_token";
    const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
    const DEFAULT_PENDING_WINDOW_MS: u64 = 15_000;

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resolved base URL is invalid.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        } else {
            Config::default()
        };
        config.with_env_overrides()
    }

    /// Parses configuration from TOML text without applying env overrides.
    ///
    /// # Errors
    /// Returns an error if the TOML is malformed.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies env overrides and validates the base URL.
    ///
    /// # Errors
    /// Returns an error if the resolved base URL is not a valid URL.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        self.base_url = resolve_base_url(Some(&self.base_url), BASE_URL_ENV, Self::DEFAULT_BASE_URL)?;
        Ok(self)
    }

    /// Base URL without a trailing slash, ready for path concatenation.
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.request_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.stream_idle_timeout_ms)
    }

    pub fn pending_window(&self) -> Duration {
        Duration::from_millis(self.pending_window_ms)
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            pending_window: self.pending_window(),
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Resolves a base URL with precedence: env > config > default.
///
/// # Errors
/// Returns an error if the chosen URL does not parse.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed)?;
            return Ok(trimmed.to_string());
        }
    }

    if let Some(config_url) = config_base_url {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed)?;
            return Ok(trimmed.to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid backend base URL: {url}"))?;
    Ok(())
}
