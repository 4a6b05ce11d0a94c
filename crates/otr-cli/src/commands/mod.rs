//! Command handler modules for otr-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod import;
pub mod report;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use otr_config::{
    load_layered_yaml, report_unused_keys, resolve_feed_secrets, ConfigConsumer, TrackerSettings,
    UnusedKeyPolicy,
};
use otr_md::{FxFeed, PriceCache, PriceFeed, StaticFeed, TwelveDataFeed};
use otr_portfolio::AccessContext;
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Used when no `--config` is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "config/base.yaml";

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid {what} uuid: {raw}"))
}

/// Settings from the given layered paths, else the default file when present,
/// else built-in defaults.
pub fn load_settings(paths: &[String]) -> Result<(TrackerSettings, Value)> {
    let paths: Vec<&str> = if paths.is_empty() {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            vec![DEFAULT_CONFIG_PATH]
        } else {
            return Ok((TrackerSettings::default(), serde_json::json!({})));
        }
    } else {
        paths.iter().map(String::as_str).collect()
    };
    let loaded = load_layered_yaml(&paths)?;
    let report = report_unused_keys(ConfigConsumer::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config has keys the cli does not read");
    }
    Ok((loaded.settings()?, loaded.config_json))
}

/// Live feed when an API key is configured, otherwise a feed with no quotes
/// so valuation falls back to manual prices and the FX fallback rate.
pub fn build_price_cache(settings: &TrackerSettings, config_json: &Value) -> Result<PriceCache> {
    let secrets = resolve_feed_secrets(config_json);
    let (prices, fx): (Arc<dyn PriceFeed>, Arc<dyn FxFeed>) = match secrets.api_key {
        Some(key) => {
            let feed = Arc::new(
                TwelveDataFeed::with_timeout(key, settings.prices.base_url.clone(), settings.prices.timeout())
                    .map_err(|e| anyhow::anyhow!("price feed init failed: {e}"))?,
            );
            (feed.clone(), feed)
        }
        None => {
            warn!(env = %secrets.api_key_env, "no price API key; using manual prices only");
            let feed = Arc::new(StaticFeed::new());
            (feed.clone(), feed)
        }
    };
    Ok(PriceCache::new(
        prices,
        fx,
        settings.prices.cache_ttl(),
        settings.fx.cache_ttl(),
        settings.fx.fallback_usd_cad,
    ))
}

/// Access context for `actor` (defaults to the owner) on `owner`'s book.
pub async fn resolve_context(pool: &PgPool, owner: Uuid, actor: Option<Uuid>) -> Result<AccessContext> {
    match actor {
        None => Ok(AccessContext::owner(owner)),
        Some(actor) => otr_db::resolve_access(pool, owner, actor).await,
    }
}
