//! Axum router and all HTTP handlers for otr-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Every portfolio route identifies the book with the
//! `x-otr-owner` header and the logged-in user with `x-otr-actor` (defaults
//! to the owner). `x-otr-role: viewer` narrows an editor grant to read-only;
//! it never widens one.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use futures_util::{Stream, StreamExt};
use otr_portfolio::{
    apply_batch, assign, assign_contracts, available_collateral, baseline_snapshot,
    compute_net_liquidation_value, delete_ledger_entry, expire, is_recommended_snapshot_date,
    lifetime_pl_cad, performance_report, record_cash, record_long_option_trade,
    record_short_option_trade, record_stock_trade, roll, set_manual_price,
    short_exposure_groups, value_positions, AccessContext, AccessRole, Assignment, BulkAssignment,
    CashMovement, Currency, EngineError, Expiration, LongOptionTrade, MarkMap, PortfolioBook,
    PortfolioSnapshot, Roll, RowId, ShortOptionTrade, StockTrade, TradeEvent, TradeReport,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api_types::{
        BatchResponse, CollateralResponse, ErrorResponse, HealthResponse, LedgerResponse,
        LedgerRowView, ManualPriceRequest, PerformanceQuery, PerformanceResponse,
        PositionsResponse, ShortsResponse, SnapshotCaptureRequest, SnapshotCaptureResponse,
        SnapshotsResponse, TradeResponse, ValuationResponse,
    },
    state::{AppState, BusMsg},
};

pub const OWNER_HEADER: &str = "x-otr-owner";
pub const ACTOR_HEADER: &str = "x-otr-actor";
pub const ROLE_HEADER: &str = "x-otr-role";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/trades/stock", post(trade_stock))
        .route("/v1/trades/long-option", post(trade_long_option))
        .route("/v1/trades/short-option", post(trade_short_option))
        .route("/v1/trades/assign", post(trade_assign))
        .route("/v1/trades/assign-bulk", post(trade_assign_bulk))
        .route("/v1/trades/expire", post(trade_expire))
        .route("/v1/trades/roll", post(trade_roll))
        .route("/v1/trades/batch", post(trade_batch))
        .route("/v1/cash", post(cash))
        .route("/v1/ledger", get(ledger))
        .route("/v1/ledger/:id", delete(ledger_delete))
        .route("/v1/positions", get(positions))
        .route("/v1/shorts", get(shorts))
        .route("/v1/collateral/:symbol", get(collateral))
        .route("/v1/valuation", get(valuation))
        .route("/v1/performance", get(performance))
        .route("/v1/snapshots", get(snapshots_list).post(snapshots_capture))
        .route("/v1/prices/manual", post(manual_price))
        .route("/v1/prices/refresh", post(prices_refresh))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    Engine(EngineError),
    Internal(anyhow::Error),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            ApiError::Engine(e) => {
                let (status, code) = match &e {
                    EngineError::ReadOnly { .. } => (StatusCode::FORBIDDEN, "read_only"),
                    EngineError::OwnerMismatch { .. } => (StatusCode::FORBIDDEN, "owner_mismatch"),
                    EngineError::EntryNotFound { .. } | EngineError::LotNotFound { .. } => {
                        (StatusCode::NOT_FOUND, "not_found")
                    }
                    EngineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                    EngineError::LotNotOpen { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "lot_not_open"),
                    EngineError::Ledger(_) => (StatusCode::UNPROCESSABLE_ENTITY, "ledger"),
                    EngineError::Position(_) => (StatusCode::UNPROCESSABLE_ENTITY, "position"),
                    EngineError::Collateral(_) => (StatusCode::UNPROCESSABLE_ENTITY, "collateral"),
                };
                (status, code, e.to_string())
            }
            ApiError::Internal(e) => {
                warn!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{e:#}"))
            }
        };
        (
            status,
            Json(ErrorResponse {
                error,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Access extractor
// ---------------------------------------------------------------------------

/// Resolved session for the request: whose book, who is acting, in what role.
pub struct Access(pub AccessContext);

fn header_uuid(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, ApiError> {
    let Some(raw) = headers.get(name) else {
        return Ok(None);
    };
    let text = raw
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{name} is not valid text")))?;
    Uuid::parse_str(text.trim())
        .map(Some)
        .map_err(|_| ApiError::BadRequest(format!("{name} is not a uuid: {text}")))
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Access {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, st: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let owner = header_uuid(&parts.headers, OWNER_HEADER)?
            .ok_or_else(|| ApiError::BadRequest(format!("missing {OWNER_HEADER} header")))?;
        let actor = header_uuid(&parts.headers, ACTOR_HEADER)?.unwrap_or(owner);
        let requested = match parts.headers.get(ROLE_HEADER) {
            Some(raw) => {
                let text = raw.to_str().unwrap_or_default();
                Some(AccessRole::parse(text).ok_or_else(|| {
                    ApiError::BadRequest(format!("{ROLE_HEADER} must be owner, editor or viewer"))
                })?)
            }
            None => None,
        };
        match st.repo.resolve_access(owner, actor).await {
            Ok(mut ctx) => {
                if requested == Some(AccessRole::Viewer) && ctx.role == AccessRole::Editor {
                    ctx.role = AccessRole::Viewer;
                }
                Ok(Access(ctx))
            }
            Err(e) if e.to_string().contains("ACCESS_DENIED") => Err(ApiError::Forbidden(e.to_string())),
            Err(e) => Err(ApiError::Internal(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared write path
// ---------------------------------------------------------------------------

/// Load the book under the owner lock, run one engine operation, commit the
/// resulting journal and announce the change. Nothing is committed when the
/// operation fails.
async fn write_op<T, F>(st: &AppState, ctx: &AccessContext, action: &str, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&AccessContext, &mut PortfolioBook) -> Result<T, EngineError>,
{
    let _guard = st.owner_lock(ctx.owner_id).await;
    let mut book = st.repo.load_book(ctx.owner_id).await?;
    let out = op(ctx, &mut book)?;
    let journal = book.take_journal();
    let rows = journal.row_count();
    let entries = journal.ledger_inserts.len() + journal.ledger_deletes.len();
    st.repo.commit(&journal).await?;

    info!(owner = %ctx.owner_id, actor = %ctx.actor_id, action, rows, "book write");
    st.publish_change(ctx.owner_id, action, entries);
    Ok(out)
}

async fn trade(
    st: &AppState,
    ctx: &AccessContext,
    action: &str,
    op: impl FnOnce(&AccessContext, &mut PortfolioBook) -> Result<TradeReport, EngineError>,
) -> Result<Json<TradeResponse>, ApiError> {
    let report = write_op(st, ctx, action, op).await?;
    Ok(Json(report.into()))
}

/// Live marks for every symbol the book can be valued against.
async fn book_marks(st: &AppState, book: &PortfolioBook) -> MarkMap {
    let mut symbols = book.longs().active_symbols();
    symbols.extend(book.shorts().open_lots().into_iter().map(|l| l.symbol.clone()));
    symbols.sort();
    symbols.dedup();
    st.prices.marks(symbols).await
}

/// Read views degrade to an empty book when the store is unreachable.
async fn book_or_empty(st: &AppState, owner: Uuid) -> PortfolioBook {
    match st.repo.load_book(owner).await {
        Ok(b) => b,
        Err(e) => {
            warn!(owner = %owner, error = %e, "book unavailable; serving empty view");
            PortfolioBook::new(owner)
        }
    }
}

async fn snapshots_or_empty(st: &AppState, owner: Uuid) -> Vec<PortfolioSnapshot> {
    match st.repo.snapshots(owner).await {
        Ok(s) => s,
        Err(e) => {
            warn!(owner = %owner, error = %e, "snapshot history unavailable");
            Vec::new()
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/trades/*, /v1/cash
// ---------------------------------------------------------------------------

pub(crate) async fn trade_stock(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<StockTrade>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "stock", |c, b| record_stock_trade(c, b, &req)).await
}

pub(crate) async fn trade_long_option(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<LongOptionTrade>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "long_option", |c, b| record_long_option_trade(c, b, &req)).await
}

pub(crate) async fn trade_short_option(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<ShortOptionTrade>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "short_option", |c, b| record_short_option_trade(c, b, &req)).await
}

pub(crate) async fn trade_assign(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<Assignment>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "assign", |c, b| assign(c, b, &req)).await
}

pub(crate) async fn trade_assign_bulk(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<BulkAssignment>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "assign_bulk", |c, b| assign_contracts(c, b, &req)).await
}

pub(crate) async fn trade_expire(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<Expiration>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "expire", |c, b| expire(c, b, &req)).await
}

pub(crate) async fn trade_roll(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<Roll>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "roll", |c, b| roll(c, b, &req)).await
}

pub(crate) async fn cash(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<CashMovement>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "cash", |c, b| record_cash(c, b, &req)).await
}

/// Apply a list of events in `(date, position in list)` order. Rows that fail
/// are reported and skipped; the rest are committed together.
pub(crate) async fn trade_batch(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(events): Json<Vec<TradeEvent>>,
) -> Result<Json<BatchResponse>, ApiError> {
    if ctx.is_read_only() {
        return Err(EngineError::ReadOnly {
            owner_id: ctx.owner_id,
            actor_id: ctx.actor_id,
        }
        .into());
    }
    let rows: Vec<(usize, TradeEvent)> = events.into_iter().enumerate().map(|(i, ev)| (i + 1, ev)).collect();
    let summary = write_op(&st, &ctx, "batch", |c, b| Ok(apply_batch(c, b, rows))).await?;
    if !summary.errors.is_empty() {
        warn!(owner = %ctx.owner_id, errors = summary.errors.len(), "batch rows rejected");
    }
    Ok(Json(BatchResponse {
        rows_committed: summary.applied,
        summary,
    }))
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub(crate) async fn ledger(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
) -> Result<Json<LedgerResponse>, ApiError> {
    let book = book_or_empty(&st, ctx.owner_id).await;
    let store = book.ledger();
    let rows = store
        .running_balance(Currency::Usd)
        .into_iter()
        .map(|r| LedgerRowView {
            entry: r.entry.clone(),
            balance: r.balance,
        })
        .collect();
    Ok(Json(LedgerResponse {
        rows,
        cash_usd: store.cash_balance(Currency::Usd),
        cash_cad: store.cash_balance(Currency::Cad),
        net_invested_cad: store.net_invested(Currency::Cad),
    }))
}

pub(crate) async fn ledger_delete(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Path(id): Path<RowId>,
) -> Result<Json<TradeResponse>, ApiError> {
    trade(&st, &ctx, "delete", |c, b| delete_ledger_entry(c, b, id)).await
}

// ---------------------------------------------------------------------------
// Positions and shorts
// ---------------------------------------------------------------------------

pub(crate) async fn positions(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
) -> Result<Json<PositionsResponse>, ApiError> {
    let book = book_or_empty(&st, ctx.owner_id).await;
    let marks = book_marks(&st, &book).await;
    Ok(Json(PositionsResponse {
        positions: value_positions(&book, &marks),
    }))
}

pub(crate) async fn shorts(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
) -> Result<Json<ShortsResponse>, ApiError> {
    let book = book_or_empty(&st, ctx.owner_id).await;
    let marks = book_marks(&st, &book).await;
    Ok(Json(ShortsResponse {
        open_lots: book.shorts().open_lots().into_iter().cloned().collect(),
        groups: short_exposure_groups(&book, &marks),
    }))
}

pub(crate) async fn collateral(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Path(symbol): Path<String>,
) -> Result<Json<CollateralResponse>, ApiError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    let book = book_or_empty(&st, ctx.owner_id).await;
    let slots = available_collateral(&book, &symbol);
    Ok(Json(CollateralResponse { symbol, slots }))
}

// ---------------------------------------------------------------------------
// Valuation and performance
// ---------------------------------------------------------------------------

pub(crate) async fn valuation(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
) -> Result<Json<ValuationResponse>, ApiError> {
    let book = book_or_empty(&st, ctx.owner_id).await;
    let marks = book_marks(&st, &book).await;
    let net = compute_net_liquidation_value(&book, &marks);
    let usd_to_cad = st.prices.usd_to_cad().await;
    let lifetime = lifetime_pl_cad(net.net_value, usd_to_cad, book.ledger());
    Ok(Json(ValuationResponse {
        net,
        usd_to_cad,
        lifetime,
    }))
}

/// Period and horizon returns. Without `as_of` today's live valuation is
/// folded in as the latest point; with `as_of` only recorded snapshots count.
pub(crate) async fn performance(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Query(q): Query<PerformanceQuery>,
) -> Result<Json<PerformanceResponse>, ApiError> {
    let book = book_or_empty(&st, ctx.owner_id).await;
    let snaps = snapshots_or_empty(&st, ctx.owner_id).await;
    let marks = book_marks(&st, &book).await;
    let live_value = compute_net_liquidation_value(&book, &marks).net_value;

    let (as_of, live) = match q.as_of {
        Some(d) => (d, None),
        None => (today(), Some((today(), live_value))),
    };
    let report = performance_report(&snaps, book.ledger(), live, as_of);
    let baseline = baseline_snapshot(&snaps, as_of).cloned();
    Ok(Json(PerformanceResponse {
        report,
        baseline,
        live_value,
    }))
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

pub(crate) async fn snapshots_list(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
) -> Result<Json<SnapshotsResponse>, ApiError> {
    let snapshots = st.repo.snapshots(ctx.owner_id).await?;
    Ok(Json(SnapshotsResponse { snapshots }))
}

/// Record today's (or the given day's) net value and FX rate. Re-capturing
/// the same day replaces it.
pub(crate) async fn snapshots_capture(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    body: Option<Json<SnapshotCaptureRequest>>,
) -> Result<Json<SnapshotCaptureResponse>, ApiError> {
    if ctx.is_read_only() {
        return Err(EngineError::ReadOnly {
            owner_id: ctx.owner_id,
            actor_id: ctx.actor_id,
        }
        .into());
    }
    let date = body.and_then(|Json(b)| b.date).unwrap_or_else(today);

    let _guard = st.owner_lock(ctx.owner_id).await;
    let book = st.repo.load_book(ctx.owner_id).await?;
    let marks = book_marks(&st, &book).await;
    let net = compute_net_liquidation_value(&book, &marks);
    let fx = st.prices.usd_to_cad().await;
    let snapshot = st
        .repo
        .upsert_snapshot(ctx.owner_id, date, net.net_value, fx)
        .await?;

    let recommended_date = is_recommended_snapshot_date(date);
    if !recommended_date {
        info!(owner = %ctx.owner_id, %date, "snapshot taken on a non-Friday date");
    }
    st.publish_change(ctx.owner_id, "snapshot", 0);
    Ok(Json(SnapshotCaptureResponse {
        snapshot,
        recommended_date,
    }))
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

pub(crate) async fn manual_price(
    State(st): State<Arc<AppState>>,
    Access(ctx): Access,
    Json(req): Json<ManualPriceRequest>,
) -> Result<StatusCode, ApiError> {
    write_op(&st, &ctx, "manual_price", |c, b| {
        set_manual_price(c, b, req.position_id, req.price)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn prices_refresh(
    State(st): State<Arc<AppState>>,
    Access(_ctx): Access,
) -> StatusCode {
    st.prices.invalidate().await;
    let _ = st.bus.send(BusMsg::LogLine {
        level: "INFO".to_string(),
        msg: "price cache cleared".to_string(),
    });
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::BookChanged { .. } => "book_changed",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None,
        }
    })
}
