//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES (e.g. `prices.api_key_env:
//! "OTR_PRICE_API_KEY"`). Binaries call [`resolve_feed_secrets`] once at startup
//! and pass the result into constructors. `Debug` output redacts values and
//! error messages mention the variable NAME only.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::settings::DEFAULT_PRICE_API_KEY_ENV;

#[derive(Clone)]
pub struct FeedSecrets {
    /// Env var the key was read from.
    pub api_key_env: String,
    /// `None` if the named env var was absent or blank.
    pub api_key: Option<String>,
}

impl std::fmt::Debug for FeedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSecrets")
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl FeedSecrets {
    /// Error naming the variable when a key is mandatory.
    pub fn require_api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(k) => Ok(k),
            None => bail!(
                "SECRETS_MISSING: required env var '{}' (price feed api key) is not set or empty",
                self.api_key_env
            ),
        }
    }
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve the price feed key from the environment. A missing key is not an
/// error here: the feed degrades to manual prices without one.
pub fn resolve_feed_secrets(config_json: &Value) -> FeedSecrets {
    let api_key_env = read_str_at(config_json, "/prices/api_key_env")
        .unwrap_or_else(|| DEFAULT_PRICE_API_KEY_ENV.to_string());
    let api_key = resolve_env(&api_key_env);
    FeedSecrets {
        api_key_env,
        api_key,
    }
}
