//! TTL cache in front of the feeds.
//!
//! Equity prices and the FX rate are cached separately with their own TTLs.
//! Failures are never cached: the next read retries the feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use otr_portfolio::{MarkMap, Micros};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::feed::{FeedError, FxFeed, PriceFeed};
use crate::symbols::{is_cash_symbol, normalize_symbol};

#[derive(Debug, Clone, Copy)]
struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Copy> Cached<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.fetched_at.elapsed() < ttl).then_some(self.value)
    }
}

pub struct PriceCache {
    prices: Arc<dyn PriceFeed>,
    fx: Arc<dyn FxFeed>,
    price_ttl: Duration,
    fx_ttl: Duration,
    fx_fallback: f64,
    price_slots: Mutex<HashMap<String, Cached<Micros>>>,
    fx_slot: Mutex<Option<Cached<f64>>>,
}

impl PriceCache {
    pub fn new(
        prices: Arc<dyn PriceFeed>,
        fx: Arc<dyn FxFeed>,
        price_ttl: Duration,
        fx_ttl: Duration,
        fx_fallback: f64,
    ) -> Self {
        Self {
            prices,
            fx,
            price_ttl,
            fx_ttl,
            fx_fallback,
            price_slots: Mutex::new(HashMap::new()),
            fx_slot: Mutex::new(None),
        }
    }

    pub fn fx_fallback(&self) -> f64 {
        self.fx_fallback
    }

    /// Last price for a raw symbol. Cash pseudo-symbols are 1.00 without a feed call.
    pub async fn price(&self, raw_symbol: &str) -> Result<Micros, FeedError> {
        let symbol = normalize_symbol(raw_symbol).ok_or_else(|| FeedError::NoPrice {
            symbol: raw_symbol.to_string(),
        })?;
        if is_cash_symbol(&symbol) {
            return Ok(Micros::dollars(1));
        }

        if let Some(px) = self
            .price_slots
            .lock()
            .await
            .get(&symbol)
            .and_then(|c| c.fresh(self.price_ttl))
        {
            debug!(symbol = %symbol, "price cache hit");
            return Ok(px);
        }

        debug!(symbol = %symbol, source = self.prices.source_name(), "price cache miss");
        let px = self.prices.last_price(&symbol).await?;
        self.price_slots.lock().await.insert(
            symbol,
            Cached {
                value: px,
                fetched_at: Instant::now(),
            },
        );
        Ok(px)
    }

    /// Like [`price`](Self::price) but a failure becomes zero, which valuation
    /// treats as "use the manual price".
    pub async fn price_or_zero(&self, raw_symbol: &str) -> Micros {
        match self.price(raw_symbol).await {
            Ok(px) => px,
            Err(err) => {
                warn!(symbol = raw_symbol, error = %err, "price unavailable, defaulting to 0");
                Micros::ZERO
            }
        }
    }

    /// Marks for a set of book symbols, keyed by the symbol as given.
    pub async fn marks<I, S>(&self, symbols: I) -> MarkMap
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = MarkMap::new();
        for s in symbols {
            let s = s.as_ref();
            if out.contains_key(s) {
                continue;
            }
            let px = self.price_or_zero(s).await;
            out.insert(s.to_string(), px);
        }
        out
    }

    /// USD→CAD rate, or the configured fallback when the feed fails.
    pub async fn usd_to_cad(&self) -> f64 {
        if let Some(rate) = self.fx_slot.lock().await.and_then(|c| c.fresh(self.fx_ttl)) {
            return rate;
        }
        match self.fx.usd_to_cad().await {
            Ok(rate) => {
                *self.fx_slot.lock().await = Some(Cached {
                    value: rate,
                    fetched_at: Instant::now(),
                });
                rate
            }
            Err(err) => {
                warn!(error = %err, fallback = self.fx_fallback, "fx unavailable, using fallback rate");
                self.fx_fallback
            }
        }
    }

    /// Drop everything cached (the "refresh prices" action).
    pub async fn invalidate(&self) {
        self.price_slots.lock().await.clear();
        *self.fx_slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        calls: AtomicUsize,
        price: Micros,
    }

    #[async_trait::async_trait]
    impl PriceFeed for CountingFeed {
        fn source_name(&self) -> &'static str {
            "counting"
        }

        async fn last_price(&self, _symbol: &str) -> Result<Micros, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.price)
        }
    }

    #[async_trait::async_trait]
    impl FxFeed for CountingFeed {
        async fn usd_to_cad(&self) -> Result<f64, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Transport("offline".into()))
        }
    }

    fn cache(feed: Arc<CountingFeed>) -> PriceCache {
        PriceCache::new(
            feed.clone(),
            feed,
            Duration::from_secs(60),
            Duration::from_secs(3_600),
            1.40,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn price_is_cached_until_ttl_expires() {
        let feed = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            price: Micros::dollars(10),
        });
        let c = cache(feed.clone());

        assert_eq!(c.price("XNAS:SOFI").await, Ok(Micros::dollars(10)));
        assert_eq!(c.price("sofi").await, Ok(Micros::dollars(10)));
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        c.price("SOFI").await.unwrap();
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cash_symbols_skip_the_feed() {
        let feed = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            price: Micros::dollars(10),
        });
        let c = cache(feed.clone());
        assert_eq!(c.price("CASH").await, Ok(Micros::dollars(1)));
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fx_failure_uses_fallback_and_is_not_cached() {
        let feed = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            price: Micros::ZERO,
        });
        let c = cache(feed.clone());
        assert!((c.usd_to_cad().await - 1.40).abs() < 1e-12);
        assert!((c.usd_to_cad().await - 1.40).abs() < 1e-12);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }
}
