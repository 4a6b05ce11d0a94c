//! otr-daemon entry point.
//!
//! Sets up tracing, loads config, picks the storage backend and price feed,
//! wires middleware, and starts the HTTP server. Route handlers live in
//! `routes.rs`; shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use otr_config::{
    load_layered_yaml, report_unused_keys, resolve_feed_secrets, ConfigConsumer, TrackerSettings,
    UnusedKeyPolicy,
};
use otr_daemon::{
    repo::{BookRepo, MemoryRepo, PgRepo},
    routes, state,
};
use otr_md::{FxFeed, PriceCache, PriceFeed, StaticFeed, TwelveDataFeed};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

const ENV_CONFIG: &str = "OTR_CONFIG";
const ENV_DAEMON_ADDR: &str = "OTR_DAEMON_ADDR";
const DEFAULT_CONFIG_PATH: &str = "config/base.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config_paths = std::env::var(ENV_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let paths: Vec<&str> = config_paths.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    let loaded = load_layered_yaml(&paths)?;
    let report = report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config has keys the daemon does not read");
    }
    let settings = loaded.settings()?;
    info!(config_hash = %loaded.config_hash, "config loaded");

    let repo = build_repo().await?;
    let prices = Arc::new(build_price_cache(&settings, &loaded.config_json)?);

    let shared = Arc::new(state::AppState::new(repo, prices));
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr(&settings)?;
    info!(backend = shared.repo.backend(), "otr-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Postgres when OTR_DATABASE_URL is set, otherwise an in-process store.
async fn build_repo() -> anyhow::Result<Arc<dyn BookRepo>> {
    if std::env::var(otr_db::ENV_DB_URL).is_err() {
        warn!("{} not set; books are kept in memory and lost on exit", otr_db::ENV_DB_URL);
        return Ok(Arc::new(MemoryRepo::new()));
    }
    let pool = otr_db::connect_from_env().await?;
    otr_db::migrate(&pool).await?;
    Ok(Arc::new(PgRepo::new(pool)))
}

fn build_price_cache(settings: &TrackerSettings, config_json: &serde_json::Value) -> anyhow::Result<PriceCache> {
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
            warn!(
                env = %secrets.api_key_env,
                "no price API key; live marks unavailable, manual prices and FX fallback apply"
            );
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

fn bind_addr(settings: &TrackerSettings) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var(ENV_DAEMON_ADDR).unwrap_or_else(|_| settings.daemon.bind_addr.clone());
    raw.parse()
        .with_context(|| format!("invalid bind address: {raw}"))
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
