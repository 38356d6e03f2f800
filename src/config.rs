//! Runtime configuration: environment variables layered over an optional
//! TOML overlay (§10.3).
//!
//! Required values are validated eagerly in [`RuntimeConfig::load`] so a
//! missing credential is a startup failure (`RuntimeError::Config`, process
//! exit before the server binds), never a mid-call surprise.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::limiter::{RateLimiterConfig, TimeoutConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierConfig {
    /// Credential carrier A validates inbound requests against (e.g. a
    /// webhook signing secret).
    pub carrier_a_auth_token: Option<String>,
    pub carrier_b_api_key: Option<String>,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            carrier_a_auth_token: None,
            carrier_b_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGatewayConfig {
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,
    pub api_key: Option<String>,
    #[serde(default = "default_model_name")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
}

fn default_model_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/model".to_string()
}

fn default_model_name() -> String {
    "models/gemini-live".to_string()
}

fn default_voice() -> String {
    "Aoede".to_string()
}

impl Default for ModelGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_model_endpoint(),
            api_key: None,
            model: default_model_name(),
            voice: default_voice(),
        }
    }
}

/// Top-level layered configuration (§10.3). Loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default)]
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub model_gateway: ModelGatewayConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfigToml,
    #[serde(default)]
    pub timeouts: TimeoutConfigToml,
}

/// TOML-friendly mirror of [`RateLimiterConfig`] (durations there are
/// `std::time::Duration`, which has no stable serde round trip as seconds
/// without an adapter crate the reference stack doesn't carry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfigToml {
    #[serde(default = "default_rate_limit_calls")]
    pub max_calls_per_window: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

fn default_rate_limit_calls() -> u32 {
    10
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

impl Default for RateLimiterConfigToml {
    fn default() -> Self {
        Self {
            max_calls_per_window: default_rate_limit_calls(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

impl From<&RateLimiterConfigToml> for RateLimiterConfig {
    fn from(c: &RateLimiterConfigToml) -> Self {
        RateLimiterConfig {
            max_calls: c.max_calls_per_window,
            window: std::time::Duration::from_millis(c.window_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfigToml {
    #[serde(default = "default_max_duration_sec")]
    pub max_duration_sec: u64,
    #[serde(default = "default_silence_sec")]
    pub silence_sec: u64,
    #[serde(default = "default_response_sec")]
    pub response_sec: u64,
}

fn default_max_duration_sec() -> u64 {
    600
}
fn default_silence_sec() -> u64 {
    30
}
fn default_response_sec() -> u64 {
    30
}

impl Default for TimeoutConfigToml {
    fn default() -> Self {
        Self {
            max_duration_sec: default_max_duration_sec(),
            silence_sec: default_silence_sec(),
            response_sec: default_response_sec(),
        }
    }
}

impl From<&TimeoutConfigToml> for TimeoutConfig {
    fn from(c: &TimeoutConfigToml) -> Self {
        TimeoutConfig {
            max_duration: std::time::Duration::from_secs(c.max_duration_sec),
            silence: std::time::Duration::from_secs(c.silence_sec),
            response: std::time::Duration::from_secs(c.response_sec),
        }
    }
}

impl RuntimeConfig {
    /// Loads the optional TOML overlay (if `RUNTIME_CONFIG_PATH` points at
    /// an existing file), then applies environment variable overrides, then
    /// validates required fields. Mirrors the reference `Config::load`
    /// shape but never silently creates a default file — a voice runtime's
    /// credentials cannot be defaulted.
    pub fn load() -> Result<Self, RuntimeError> {
        let mut config = if let Some(path) = config_overlay_path() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| RuntimeError::Config(format!("failed to read {}: {e}", path.display())))?;
            toml::from_str(&contents)
                .map_err(|e| RuntimeError::Config(format!("failed to parse {}: {e}", path.display())))?
        } else {
            RuntimeConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PUBLIC_BASE_URL") {
            self.public_base_url = v;
        }
        if let Ok(v) = std::env::var("CARRIER_A_AUTH_TOKEN") {
            self.carrier.carrier_a_auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("CARRIER_B_API_KEY") {
            self.carrier.carrier_b_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("MODEL_GATEWAY_ENDPOINT") {
            self.model_gateway.endpoint = v;
        }
        if let Ok(v) = std::env::var("MODEL_API_KEY") {
            self.model_gateway.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("MODEL_NAME") {
            self.model_gateway.model = v;
        }
        self.rate_limiter.max_calls_per_window = std::env::var("RATE_LIMIT_CALLS_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.rate_limiter.max_calls_per_window);
        self.rate_limiter.window_ms = std::env::var("RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.rate_limiter.window_ms);
        self.timeouts.max_duration_sec = std::env::var("MAX_CALL_DURATION_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.timeouts.max_duration_sec);
        self.timeouts.silence_sec = std::env::var("SILENCE_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.timeouts.silence_sec);
    }

    /// Fails fast on missing required credentials (§10.3). A `RuntimeConfig`
    /// that passes this check is safe to build a server around.
    fn validate(&self) -> Result<(), RuntimeError> {
        if self.public_base_url.is_empty() {
            return Err(RuntimeError::Config("PUBLIC_BASE_URL is required".into()));
        }
        if self.model_gateway.api_key.is_none() {
            return Err(RuntimeError::Config("MODEL_API_KEY is required".into()));
        }
        if self.carrier.carrier_a_auth_token.is_none() && self.carrier.carrier_b_api_key.is_none() {
            return Err(RuntimeError::Config(
                "at least one of CARRIER_A_AUTH_TOKEN or CARRIER_B_API_KEY is required".into(),
            ));
        }
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::from(&self.rate_limiter)
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::from(&self.timeouts)
    }
}

fn config_overlay_path() -> Option<PathBuf> {
    std::env::var("RUNTIME_CONFIG_PATH").ok().map(PathBuf::from).filter(|p| p.exists())
}
