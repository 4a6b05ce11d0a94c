//! Feed boundary: the traits valuation depends on and their error type.

use std::collections::BTreeMap;
use std::fmt;

use otr_portfolio::Micros;

/// Errors that a feed implementation may return.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedError {
    /// Network or transport failure.
    Transport(String),
    /// The upstream API returned an application-level error.
    Api { code: Option<i64>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value (e.g. API key) is missing or invalid.
    Config(String),
    /// The feed answered but had no usable (positive) price.
    NoPrice { symbol: String },
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::Transport(msg) => write!(f, "transport error: {msg}"),
            FeedError::Api {
                code: Some(c),
                message,
            } => write!(f, "feed api error code={c}: {message}"),
            FeedError::Api {
                code: None,
                message,
            } => write!(f, "feed api error: {message}"),
            FeedError::Decode(msg) => write!(f, "decode error: {msg}"),
            FeedError::Config(msg) => write!(f, "config error: {msg}"),
            FeedError::NoPrice { symbol } => write!(f, "no price for {symbol}"),
        }
    }
}

impl std::error::Error for FeedError {}

/// Last-trade price source. Symbols arrive already normalized.
#[async_trait::async_trait]
pub trait PriceFeed: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn last_price(&self, symbol: &str) -> Result<Micros, FeedError>;
}

/// USD→CAD rate source.
#[async_trait::async_trait]
pub trait FxFeed: Send + Sync {
    async fn usd_to_cad(&self) -> Result<f64, FeedError>;
}

/// In-memory feed with fixed answers. Unknown symbols return `NoPrice`; a
/// missing FX rate returns `Api`, which exercises every fallback path.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    prices: BTreeMap<String, Micros>,
    usd_cad: Option<f64>,
}

impl StaticFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, symbol: &str, price: Micros) -> Self {
        self.prices.insert(symbol.to_ascii_uppercase(), price);
        self
    }

    pub fn with_usd_cad(mut self, rate: f64) -> Self {
        self.usd_cad = Some(rate);
        self
    }
}

#[async_trait::async_trait]
impl PriceFeed for StaticFeed {
    fn source_name(&self) -> &'static str {
        "static"
    }

    async fn last_price(&self, symbol: &str) -> Result<Micros, FeedError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| FeedError::NoPrice {
                symbol: symbol.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl FxFeed for StaticFeed {
    async fn usd_to_cad(&self) -> Result<f64, FeedError> {
        self.usd_cad.ok_or_else(|| FeedError::Api {
            code: None,
            message: "no fx rate configured".to_string(),
        })
    }
}
