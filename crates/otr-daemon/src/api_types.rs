//! Request and response types for the otr-daemon HTTP endpoints.
//!
//! Engine request types (`StockTrade`, `Roll`, ...) are accepted as-is; the
//! types here cover what the engine does not already model.

use chrono::NaiveDate;
use otr_portfolio::{
    BatchSummary, CollateralSlot, FillOutcome, LedgerEntry, LifetimePl, Micros, NetLiquidation,
    PerformanceReport, PortfolioSnapshot, PositionValuation, RowId, ShortGroup, ShortOptionLot,
    TradeReport,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable code: "read_only", "not_found", "invalid_input", ...
    pub code: String,
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TradeResponse {
    pub entries: Vec<LedgerEntry>,
    pub fill: FillOutcome,
    pub group_id: Option<Uuid>,
    pub position_id: Option<RowId>,
    pub lot_ids: Vec<RowId>,
    pub net_cash: Micros,
}

impl From<TradeReport> for TradeResponse {
    fn from(r: TradeReport) -> Self {
        let net_cash = r.net_cash();
        Self {
            entries: r.entries,
            fill: r.fill,
            group_id: r.group_id,
            position_id: r.position_id,
            lot_ids: r.lot_ids,
            net_cash,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    #[serde(flatten)]
    pub summary: BatchSummary,
    pub rows_committed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPriceRequest {
    pub position_id: RowId,
    pub price: Micros,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotCaptureRequest {
    /// Defaults to today.
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCaptureResponse {
    pub snapshot: PortfolioSnapshot,
    /// Friday or Dec 31.
    pub recommended_date: bool,
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LedgerRowView {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    /// Running USD balance after this row (chronological order).
    pub balance: Micros,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerResponse {
    pub rows: Vec<LedgerRowView>,
    pub cash_usd: Micros,
    pub cash_cad: Micros,
    pub net_invested_cad: Micros,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsResponse {
    pub positions: Vec<PositionValuation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShortsResponse {
    pub open_lots: Vec<ShortOptionLot>,
    pub groups: Vec<ShortGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollateralResponse {
    pub symbol: String,
    pub slots: Vec<CollateralSlot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValuationResponse {
    pub net: NetLiquidation,
    pub usd_to_cad: f64,
    pub lifetime: LifetimePl,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerformanceQuery {
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceResponse {
    #[serde(flatten)]
    pub report: PerformanceReport,
    pub baseline: Option<PortfolioSnapshot>,
    pub live_value: Micros,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotsResponse {
    pub snapshots: Vec<PortfolioSnapshot>,
}
