//! In-process scenario tests for otr-daemon HTTP endpoints.
//!
//! The router runs against `MemoryRepo` and a `StaticFeed`, driven via
//! `tower::ServiceExt::oneshot`; no socket, database or network is needed.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use async_trait::async_trait;
use chrono::NaiveDate;
use otr_daemon::{
    repo::{BookRepo, MemoryRepo},
    routes::{self, ACTOR_HEADER, OWNER_HEADER, ROLE_HEADER},
    state,
};
use otr_md::{PriceCache, StaticFeed};
use otr_portfolio::{AccessContext, AccessRole, Journal, Micros, PortfolioBook, PortfolioSnapshot};
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const OWNER: Uuid = Uuid::from_u128(0xA11CE);

struct Harness {
    router: axum::Router,
    repo: Arc<MemoryRepo>,
}

fn make_harness() -> Harness {
    let repo = Arc::new(MemoryRepo::new());
    Harness {
        router: router_over(repo.clone()),
        repo,
    }
}

fn router_over(repo: Arc<dyn BookRepo>) -> axum::Router {
    let feed = Arc::new(
        StaticFeed::new()
            .with_price("AAPL", Micros::dollars(170))
            .with_usd_cad(1.25),
    );
    let prices = Arc::new(PriceCache::new(
        feed.clone(),
        feed,
        Duration::from_secs(60),
        Duration::from_secs(3600),
        1.4,
    ));
    routes::build_router(Arc::new(state::AppState::new(repo, prices)))
}

async fn call(router: &axum::Router, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("body is not valid JSON")
    };
    (status, json)
}

fn get(uri: &str, owner: Uuid) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(OWNER_HEADER, owner.to_string())
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post(uri: &str, owner: Uuid, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(OWNER_HEADER, owner.to_string())
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn as_actor(mut req: Request<axum::body::Body>, actor: Uuid) -> Request<axum::body::Body> {
    req.headers_mut()
        .insert(ACTOR_HEADER, actor.to_string().parse().unwrap());
    req
}

fn deposit(amount: i64, date: &str) -> Value {
    json!({ "kind": "deposit", "amount": amount, "date": date })
}

fn buy_aapl(qty: i64, price: i64, date: &str) -> Value {
    json!({ "symbol": "aapl", "quantity": qty, "price": price, "side": "BUY", "date": date })
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let h = make_harness();
    let req = Request::builder()
        .method("GET")
        .uri("/v1/health")
        .body(axum::body::Body::empty())
        .unwrap();

    let (status, json) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "otr-daemon");
}

// ---------------------------------------------------------------------------
// Session headers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_owner_header_is_400() {
    let h = make_harness();
    let req = Request::builder()
        .method("GET")
        .uri("/v1/ledger")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "bad_request");
}

#[tokio::test]
async fn actor_without_grant_is_403() {
    let h = make_harness();
    let stranger = Uuid::from_u128(0xBAD);
    let (status, json) = call(&h.router, as_actor(get("/v1/ledger", OWNER), stranger)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "forbidden");
}

#[tokio::test]
async fn viewer_can_read_but_not_write() {
    let h = make_harness();
    let viewer = Uuid::from_u128(0xF00D);
    h.repo.grant(OWNER, viewer, AccessRole::Viewer).await.unwrap();

    let (status, _) = call(&h.router, post("/v1/cash", OWNER, deposit(1_000, "2024-01-02"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = call(
        &h.router,
        as_actor(post("/v1/cash", OWNER, deposit(50, "2024-01-03")), viewer),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "read_only");

    let (status, json) = call(&h.router, as_actor(get("/v1/ledger", OWNER), viewer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rows"].as_array().unwrap().len(), 1);
    assert_eq!(json["cash_usd"].as_f64(), Some(1_000.0));
}

#[tokio::test]
async fn editor_writes_land_in_owner_book() {
    let h = make_harness();
    let editor = Uuid::from_u128(0xED);
    h.repo.grant(OWNER, editor, AccessRole::Editor).await.unwrap();

    let (status, _) = call(
        &h.router,
        as_actor(post("/v1/cash", OWNER, deposit(500, "2024-01-02")), editor),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = call(&h.router, get("/v1/ledger", OWNER)).await;
    assert_eq!(json["cash_usd"].as_f64(), Some(500.0));
}

#[tokio::test]
async fn role_header_narrows_an_editor_to_read_only() {
    let h = make_harness();
    let editor = Uuid::from_u128(0xED);
    h.repo.grant(OWNER, editor, AccessRole::Editor).await.unwrap();

    let mut req = as_actor(post("/v1/cash", OWNER, deposit(500, "2024-01-02")), editor);
    req.headers_mut().insert(ROLE_HEADER, "viewer".parse().unwrap());
    let (status, json) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "read_only");
}

#[tokio::test]
async fn role_header_cannot_widen_a_viewer() {
    let h = make_harness();
    let viewer = Uuid::from_u128(0xF00D);
    h.repo.grant(OWNER, viewer, AccessRole::Viewer).await.unwrap();

    let mut req = as_actor(post("/v1/cash", OWNER, deposit(500, "2024-01-02")), viewer);
    req.headers_mut().insert(ROLE_HEADER, "editor".parse().unwrap());
    let (status, _) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ---------------------------------------------------------------------------
// Trades, positions, ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stock_buy_shows_up_in_positions_with_live_mark() {
    let h = make_harness();
    call(&h.router, post("/v1/cash", OWNER, deposit(20_000, "2024-01-02"))).await;

    let (status, json) = call(&h.router, post("/v1/trades/stock", OWNER, buy_aapl(100, 150, "2024-01-03"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["fill"]["status"], "ok");
    assert_eq!(json["net_cash"].as_f64(), Some(-15_000.0));

    let (status, json) = call(&h.router, get("/v1/positions", OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    let rows = json["positions"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["position"]["symbol"], "AAPL");
    assert_eq!(rows[0]["mark"].as_f64(), Some(170.0));
    assert_eq!(rows[0]["unrealized"].as_f64(), Some(2_000.0));
}

#[tokio::test]
async fn invalid_trade_is_400_and_writes_nothing() {
    let h = make_harness();
    let (status, json) = call(&h.router, post("/v1/trades/stock", OWNER, buy_aapl(0, 150, "2024-01-03"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_input");

    let (_, json) = call(&h.router, get("/v1/ledger", OWNER)).await;
    assert!(json["rows"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_trade_entry_reverses_the_position() {
    let h = make_harness();
    let (_, trade) = call(&h.router, post("/v1/trades/stock", OWNER, buy_aapl(10, 100, "2024-02-01"))).await;
    let id = trade["entries"][0]["id"].as_i64().unwrap();

    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/ledger/{id}"))
        .header(OWNER_HEADER, OWNER.to_string())
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = call(&h.router, get("/v1/positions", OWNER)).await;
    assert!(json["positions"].as_array().unwrap().is_empty());
    let (_, json) = call(&h.router, get("/v1/ledger", OWNER)).await;
    assert!(json["rows"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn deleting_unknown_entry_is_404() {
    let h = make_harness();
    let req = Request::builder()
        .method("DELETE")
        .uri("/v1/ledger/999")
        .header(OWNER_HEADER, OWNER.to_string())
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "not_found");
}

#[tokio::test]
async fn short_call_is_auto_linked_and_reported_in_groups() {
    let h = make_harness();
    call(&h.router, post("/v1/trades/stock", OWNER, buy_aapl(100, 150, "2024-01-03"))).await;

    let sell = json!({
        "symbol": "AAPL", "option_type": "CALL", "strike": 160, "expiration": "2024-03-15",
        "contracts": 1, "premium": 2, "side": "SELL", "date": "2024-01-04"
    });
    let (status, json) = call(&h.router, post("/v1/trades/short-option", OWNER, sell)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["net_cash"].as_f64(), Some(200.0));

    let (status, json) = call(&h.router, get("/v1/shorts", OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["open_lots"].as_array().unwrap().len(), 1);
    let group = &json["groups"][0];
    assert_eq!(group["covered"], true);
    // AAPL marks at 170 against a 160 strike.
    assert_eq!(group["liability"].as_f64(), Some(1_000.0));

    let (_, json) = call(&h.router, get("/v1/collateral/aapl", OWNER)).await;
    assert_eq!(json["symbol"], "AAPL");
    assert_eq!(json["slots"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn batch_reports_bad_rows_and_commits_the_rest() {
    let h = make_harness();
    let events = json!([
        { "type": "stock", "symbol": "AAPL", "quantity": 10, "price": 100, "side": "BUY", "date": "2024-01-05" },
        { "type": "assign", "lot_id": 42, "contracts": 1, "date": "2024-01-06" },
        { "type": "cash", "kind": "deposit", "amount": 5000, "date": "2024-01-01" }
    ]);
    let (status, json) = call(&h.router, post("/v1/trades/batch", OWNER, events)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["applied"], 2);
    assert_eq!(json["rows_committed"], 2);
    let errors = json["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["row"], 2);

    let (_, json) = call(&h.router, get("/v1/ledger", OWNER)).await;
    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    // Chronological: the deposit dated first comes first.
    assert_eq!(rows[0]["kind"], "DEPOSIT");
    assert_eq!(rows[1]["balance"].as_f64(), Some(4_000.0));
}

// ---------------------------------------------------------------------------
// Valuation, snapshots, performance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valuation_nets_itm_call_liability() {
    let h = make_harness();
    call(&h.router, post("/v1/cash", OWNER, deposit(20_000, "2024-01-02"))).await;
    call(&h.router, post("/v1/trades/stock", OWNER, buy_aapl(100, 150, "2024-01-03"))).await;
    let sell = json!({
        "symbol": "AAPL", "option_type": "CALL", "strike": 160, "expiration": "2024-03-15",
        "contracts": 1, "premium": 2, "side": "SELL", "date": "2024-01-04"
    });
    call(&h.router, post("/v1/trades/short-option", OWNER, sell)).await;

    let (status, json) = call(&h.router, get("/v1/valuation", OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["net"]["cash"].as_f64(), Some(5_200.0));
    assert_eq!(json["net"]["stock_value"].as_f64(), Some(17_000.0));
    assert_eq!(json["net"]["itm_call_liability"].as_f64(), Some(1_000.0));
    assert_eq!(json["net"]["net_value"].as_f64(), Some(21_200.0));
    assert_eq!(json["usd_to_cad"].as_f64(), Some(1.25));
}

#[tokio::test]
async fn manual_price_values_a_leap() {
    let h = make_harness();
    let leap = json!({
        "symbol": "MSFT", "option_type": "CALL", "strike": 300, "expiration": "2026-01-16",
        "contracts": 2, "premium": 50, "side": "BUY", "date": "2024-01-02"
    });
    let (_, trade) = call(&h.router, post("/v1/trades/long-option", OWNER, leap)).await;
    let position_id = trade["position_id"].as_i64().unwrap();

    let (status, _) = call(
        &h.router,
        post("/v1/prices/manual", OWNER, json!({ "position_id": position_id, "price": 65 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, json) = call(&h.router, get("/v1/valuation", OWNER)).await;
    assert_eq!(json["net"]["long_option_value"].as_f64(), Some(13_000.0));
}

#[tokio::test]
async fn snapshot_capture_upserts_per_day() {
    let h = make_harness();
    call(&h.router, post("/v1/cash", OWNER, deposit(10_000, "2024-01-02"))).await;

    // 2024-06-14 is a Friday.
    let (status, json) = call(&h.router, post("/v1/snapshots", OWNER, json!({ "date": "2024-06-14" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["recommended_date"], true);
    assert_eq!(json["snapshot"]["total_equity"].as_f64(), Some(10_000.0));
    assert_eq!(json["snapshot"]["exchange_rate"].as_f64(), Some(1.25));

    call(&h.router, post("/v1/cash", OWNER, deposit(1_000, "2024-06-14"))).await;
    let (_, json) = call(&h.router, post("/v1/snapshots", OWNER, json!({ "date": "2024-06-14" }))).await;
    assert_eq!(json["snapshot"]["total_equity"].as_f64(), Some(11_000.0));

    let (_, json) = call(&h.router, get("/v1/snapshots", OWNER)).await;
    assert_eq!(json["snapshots"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn performance_as_of_uses_recorded_snapshots() {
    let h = make_harness();
    call(&h.router, post("/v1/snapshots", OWNER, json!({ "date": "2023-12-31" }))).await;
    call(&h.router, post("/v1/cash", OWNER, deposit(10_000, "2024-01-02"))).await;
    call(&h.router, post("/v1/snapshots", OWNER, json!({ "date": "2024-01-05" }))).await;

    let (status, json) = call(&h.router, get("/v1/performance?as_of=2024-01-05", OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["as_of"], "2024-01-05");
    assert_eq!(json["baseline"]["snapshot_date"], "2023-12-31");
    assert_eq!(json["days_elapsed"], 5);
    let periods = json["periods"].as_array().unwrap();
    assert_eq!(periods.len(), 2);
    // The deposit is a flow, not a gain.
    assert_eq!(periods[1]["net_flow"].as_f64(), Some(10_000.0));
    assert_eq!(periods[1]["profit"].as_f64(), Some(0.0));
}

#[tokio::test]
async fn viewer_cannot_capture_snapshots() {
    let h = make_harness();
    let viewer = Uuid::from_u128(0xF00D);
    h.repo.grant(OWNER, viewer, AccessRole::Viewer).await.unwrap();
    let (status, _) = call(
        &h.router,
        as_actor(post("/v1/snapshots", OWNER, json!({})), viewer),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn price_refresh_is_204() {
    let h = make_harness();
    let (status, json) = call(&h.router, post("/v1/prices/refresh", OWNER, Value::Null)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(json.is_null());
}

#[tokio::test]
async fn price_refresh_without_owner_header_is_400() {
    let h = make_harness();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/prices/refresh")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = call(&h.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "bad_request");
}

// ---------------------------------------------------------------------------
// Store outage
// ---------------------------------------------------------------------------

/// Grants every owner session but cannot read or write rows.
struct UnreachableRepo;

#[async_trait]
impl BookRepo for UnreachableRepo {
    fn backend(&self) -> &'static str {
        "unreachable"
    }

    async fn load_book(&self, _owner: Uuid) -> anyhow::Result<PortfolioBook> {
        anyhow::bail!("connection refused")
    }

    async fn commit(&self, _journal: &Journal) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn snapshots(&self, _owner: Uuid) -> anyhow::Result<Vec<PortfolioSnapshot>> {
        anyhow::bail!("connection refused")
    }

    async fn upsert_snapshot(
        &self,
        _owner: Uuid,
        _date: NaiveDate,
        _total_equity: Micros,
        _exchange_rate: f64,
    ) -> anyhow::Result<PortfolioSnapshot> {
        anyhow::bail!("connection refused")
    }

    async fn resolve_access(&self, owner: Uuid, _actor: Uuid) -> anyhow::Result<AccessContext> {
        Ok(AccessContext::owner(owner))
    }
}

#[tokio::test]
async fn read_views_serve_an_empty_book_when_the_store_is_down() {
    let router = router_over(Arc::new(UnreachableRepo));

    let (status, json) = call(&router, get("/v1/valuation", OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["net"]["net_value"].as_f64(), Some(0.0));
    assert_eq!(json["net"]["cash"].as_f64(), Some(0.0));

    let (status, json) = call(&router, get("/v1/ledger", OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rows"].as_array().unwrap().len(), 0);
    assert_eq!(json["cash_usd"].as_f64(), Some(0.0));

    for uri in ["/v1/positions", "/v1/shorts", "/v1/collateral/AAPL", "/v1/performance"] {
        let (status, _) = call(&router, get(uri, OWNER)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn writes_still_fail_when_the_store_is_down() {
    let router = router_over(Arc::new(UnreachableRepo));
    let (status, _) = call(&router, post("/v1/cash", OWNER, deposit(100, "2024-01-02"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
