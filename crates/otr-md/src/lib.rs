//! otr-md
//!
//! Market data for valuation: symbol cleanup, the price/FX feed boundary, a
//! TwelveData-backed HTTP feed and a TTL cache in front of it.
//!
//! Nothing here touches the book or the database. Feed failures are returned
//! as [`FeedError`]; [`PriceCache`] is where they get defaulted (zero price,
//! fallback FX rate) so valuation can fall back to manual prices.

pub mod cache;
pub mod feed;
pub mod symbols;
pub mod twelvedata;

pub use cache::PriceCache;
pub use feed::{FeedError, FxFeed, PriceFeed, StaticFeed};
pub use symbols::{is_cash_symbol, normalize_symbol, CASH_SYMBOLS};
pub use twelvedata::TwelveDataFeed;
