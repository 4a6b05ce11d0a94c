//! Typed view over the merged config JSON.
//!
//! Every field has a default, so an empty document yields a working setup.
//! Present-but-wrong values are errors rather than silently defaulted.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_FX_FALLBACK_USD_CAD: f64 = 1.40;
pub const DEFAULT_FX_TTL_SECS: u64 = 3_600;
pub const DEFAULT_PRICE_TTL_SECS: u64 = 60;
pub const DEFAULT_PRICE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PRICE_BASE_URL: &str = "https://api.twelvedata.com";
pub const DEFAULT_PRICE_API_KEY_ENV: &str = "OTR_PRICE_API_KEY";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8899";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxSettings {
    /// USD→CAD rate used when the FX feed is unavailable.
    pub fallback_usd_cad: f64,
    pub cache_ttl_secs: u64,
}

impl FxSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSettings {
    pub base_url: String,
    /// Name of the env var holding the feed API key (never the key itself).
    pub api_key_env: String,
    pub cache_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl PriceSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonSettings {
    pub bind_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSettings {
    /// "USD" or "CAD".
    pub default_currency: String,
    pub fx: FxSettings,
    pub prices: PriceSettings,
    pub daemon: DaemonSettings,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            fx: FxSettings {
                fallback_usd_cad: DEFAULT_FX_FALLBACK_USD_CAD,
                cache_ttl_secs: DEFAULT_FX_TTL_SECS,
            },
            prices: PriceSettings {
                base_url: DEFAULT_PRICE_BASE_URL.to_string(),
                api_key_env: DEFAULT_PRICE_API_KEY_ENV.to_string(),
                cache_ttl_secs: DEFAULT_PRICE_TTL_SECS,
                timeout_secs: DEFAULT_PRICE_TIMEOUT_SECS,
            },
            daemon: DaemonSettings {
                bind_addr: DEFAULT_BIND_ADDR.to_string(),
            },
        }
    }
}

impl TrackerSettings {
    pub fn from_config_json(config: &Value) -> Result<Self> {
        let d = Self::default();

        let default_currency = match opt_str(config, "/tracker/default_currency")? {
            Some(c) => {
                let c = c.to_ascii_uppercase();
                if c != "USD" && c != "CAD" {
                    bail!("CONFIG_INVALID /tracker/default_currency: expected USD or CAD, got {c}");
                }
                c
            }
            None => d.default_currency,
        };

        let fallback_usd_cad =
            opt_f64(config, "/fx/fallback_usd_cad")?.unwrap_or(d.fx.fallback_usd_cad);
        if !(fallback_usd_cad.is_finite() && fallback_usd_cad > 0.0) {
            bail!("CONFIG_INVALID /fx/fallback_usd_cad: must be a positive number");
        }

        let base_url = opt_str(config, "/prices/base_url")?.unwrap_or(d.prices.base_url);
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("CONFIG_INVALID /prices/base_url: must be an http(s) URL");
        }

        Ok(Self {
            default_currency,
            fx: FxSettings {
                fallback_usd_cad,
                cache_ttl_secs: opt_u64(config, "/fx/cache_ttl_secs")?
                    .unwrap_or(d.fx.cache_ttl_secs),
            },
            prices: PriceSettings {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key_env: opt_str(config, "/prices/api_key_env")?
                    .unwrap_or(d.prices.api_key_env),
                cache_ttl_secs: opt_u64(config, "/prices/cache_ttl_secs")?
                    .unwrap_or(d.prices.cache_ttl_secs),
                timeout_secs: opt_u64(config, "/prices/timeout_secs")?
                    .unwrap_or(d.prices.timeout_secs),
            },
            daemon: DaemonSettings {
                bind_addr: opt_str(config, "/daemon/bind_addr")?.unwrap_or(d.daemon.bind_addr),
            },
        })
    }
}

fn opt_str(config: &Value, pointer: &str) -> Result<Option<String>> {
    match config.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => bail!("CONFIG_INVALID {pointer}: expected a string"),
    }
}

fn opt_f64(config: &Value, pointer: &str) -> Result<Option<f64>> {
    match config.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(x) => Ok(Some(x)),
            None => bail!("CONFIG_INVALID {pointer}: expected a number"),
        },
    }
}

fn opt_u64(config: &Value, pointer: &str) -> Result<Option<u64>> {
    match config.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(x) => Ok(Some(x)),
            None => bail!("CONFIG_INVALID {pointer}: expected a non-negative integer"),
        },
    }
}
