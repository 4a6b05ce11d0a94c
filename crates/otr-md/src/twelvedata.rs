//! TwelveData-backed price and FX feed.
//!
//! API key is resolved by the caller and passed in; do not log it.

use std::time::Duration;

use otr_portfolio::Micros;
use serde::Deserialize;

use crate::feed::{FeedError, FxFeed, PriceFeed};

const DEFAULT_BASE_URL: &str = "https://api.twelvedata.com";

#[derive(Debug, Clone)]
pub struct TwelveDataFeed {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl TwelveDataFeed {
    pub fn new(api_key: String) -> Self {
        Self::new_with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn new_with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Same as [`new_with_base_url`](Self::new_with_base_url) with a per-request timeout.
    pub fn with_timeout(api_key: String, base_url: String, timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_key,
            http,
            base_url,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        symbol: &str,
    ) -> Result<T, FeedError> {
        let resp = self
            .http
            .get(self.url(endpoint))
            .query(&[("symbol", symbol), ("apikey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FeedError::Decode(format!("response json decode failed: {e}")))?;

        // Errors come back either as a non-2xx status or as {"status":"error", ...} with 200.
        if !status.is_success() || body.get("status").and_then(|s| s.as_str()) == Some("error") {
            let code = body
                .get("code")
                .and_then(|c| c.as_i64())
                .or(Some(i64::from(status.as_u16())));
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(FeedError::Api { code, message });
        }

        serde_json::from_value(body).map_err(|e| FeedError::Decode(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: NumOrString,
}

#[derive(Debug, Deserialize)]
struct ExchangeRateResponse {
    rate: NumOrString,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(f64),
    Str(String),
}

impl NumOrString {
    fn to_micros(&self) -> Option<Micros> {
        match self {
            NumOrString::Num(x) => Micros::from_f64(*x),
            NumOrString::Str(s) => Micros::parse_decimal(s).ok(),
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match self {
            NumOrString::Num(x) => Some(*x),
            NumOrString::Str(s) => s.trim().parse().ok(),
        }
    }
}

#[async_trait::async_trait]
impl PriceFeed for TwelveDataFeed {
    fn source_name(&self) -> &'static str {
        "twelvedata"
    }

    async fn last_price(&self, symbol: &str) -> Result<Micros, FeedError> {
        let body: PriceResponse = self.get_json("price", symbol).await?;
        match body.price.to_micros() {
            Some(px) if px.is_positive() => Ok(px),
            _ => Err(FeedError::NoPrice {
                symbol: symbol.to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl FxFeed for TwelveDataFeed {
    async fn usd_to_cad(&self) -> Result<f64, FeedError> {
        let body: ExchangeRateResponse = self.get_json("exchange_rate", "USD/CAD").await?;
        match body.rate.to_f64() {
            Some(r) if r.is_finite() && r > 0.0 => Ok(r),
            _ => Err(FeedError::Decode("exchange rate is not a positive number".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let f = TwelveDataFeed::new_with_base_url("k".into(), "http://localhost:1/".into());
        assert_eq!(f.url("price"), "http://localhost:1/price");
    }

    #[test]
    fn numeric_and_string_prices_decode() {
        let a: PriceResponse = serde_json::from_str(r#"{"price":"182.34000"}"#).unwrap();
        let b: PriceResponse = serde_json::from_str(r#"{"price":182.34}"#).unwrap();
        assert_eq!(a.price.to_micros(), Some(Micros::cents(18_234)));
        assert_eq!(b.price.to_micros(), Some(Micros::cents(18_234)));
    }
}
