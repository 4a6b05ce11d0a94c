//! Snapshot and report commands. Output is `key=value` lines.

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use otr_md::PriceCache;
use otr_portfolio::{
    baseline_snapshot, compute_net_liquidation_value, is_recommended_snapshot_date,
    lifetime_pl_cad, performance_report, AccessContext, HorizonReturn, MarkMap, NetLiquidation,
    PerformanceReport, PortfolioBook,
};
use sqlx::PgPool;
use tracing::{info, warn};

pub async fn book_marks(prices: &PriceCache, book: &PortfolioBook) -> MarkMap {
    let mut symbols = book.longs().active_symbols();
    symbols.extend(book.shorts().open_lots().into_iter().map(|l| l.symbol.clone()));
    symbols.sort();
    symbols.dedup();
    prices.marks(symbols).await
}

pub async fn snapshot_capture(
    pool: &PgPool,
    prices: &PriceCache,
    ctx: &AccessContext,
    date: Option<NaiveDate>,
) -> Result<()> {
    if ctx.is_read_only() {
        bail!(
            "actor {} has read-only access to portfolio {}",
            ctx.actor_id,
            ctx.owner_id
        );
    }
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let book = otr_db::load_book(pool, ctx.owner_id).await?;
    let marks = book_marks(prices, &book).await;
    let net = compute_net_liquidation_value(&book, &marks);
    let fx = prices.usd_to_cad().await;

    let snap = otr_db::upsert_snapshot(pool, ctx.owner_id, date, net.net_value, fx).await?;
    let recommended = is_recommended_snapshot_date(date);
    if !recommended {
        warn!(%date, "snapshot date is neither a Friday nor Dec 31");
    }
    info!(owner = %ctx.owner_id, %date, equity = %snap.total_equity, "snapshot stored");

    println!("snapshot_id={}", snap.id);
    println!("snapshot_date={}", snap.snapshot_date);
    println!("total_equity={}", snap.total_equity);
    println!("exchange_rate={}", snap.exchange_rate);
    println!("recommended_date={recommended}");
    Ok(())
}

pub async fn snapshot_list(pool: &PgPool, ctx: &AccessContext) -> Result<()> {
    let snaps = otr_db::list_snapshots(pool, ctx.owner_id).await?;
    println!("snapshots={}", snaps.len());
    for s in snaps {
        println!(
            "date={} total_equity={} exchange_rate={}",
            s.snapshot_date, s.total_equity, s.exchange_rate
        );
    }
    Ok(())
}

pub async fn valuation(pool: &PgPool, prices: &PriceCache, ctx: &AccessContext) -> Result<()> {
    let book = otr_db::load_book(pool, ctx.owner_id).await?;
    let marks = book_marks(prices, &book).await;
    let net = compute_net_liquidation_value(&book, &marks);
    let fx = prices.usd_to_cad().await;
    print_valuation(&net, fx);

    let pl = lifetime_pl_cad(net.net_value, fx, book.ledger());
    println!("net_invested_cad={}", pl.net_invested_cad);
    println!("value_cad={}", pl.value_cad);
    println!("profit_cad={}", pl.profit_cad);
    println!("lifetime_return={}", pct(pl.return_rate));
    Ok(())
}

pub fn print_valuation(net: &NetLiquidation, usd_to_cad: f64) {
    println!("cash={}", net.cash);
    println!("cash_cad={}", net.cash_cad);
    println!("stock_value={}", net.stock_value);
    println!("long_option_value={}", net.long_option_value);
    println!("itm_call_liability={}", net.itm_call_liability);
    println!("net_value={}", net.net_value);
    println!("usd_to_cad={usd_to_cad}");
}

/// With `as_of` only stored snapshots count; otherwise today's live value is
/// the last point.
pub async fn performance(
    pool: &PgPool,
    prices: &PriceCache,
    ctx: &AccessContext,
    as_of: Option<NaiveDate>,
) -> Result<()> {
    let book = otr_db::load_book(pool, ctx.owner_id).await?;
    let snaps = otr_db::list_snapshots(pool, ctx.owner_id).await?;

    let (as_of, live) = match as_of {
        Some(d) => (d, None),
        None => {
            let marks = book_marks(prices, &book).await;
            let today = Utc::now().date_naive();
            let value = compute_net_liquidation_value(&book, &marks).net_value;
            (today, Some((today, value)))
        }
    };

    let report = performance_report(&snaps, book.ledger(), live, as_of);
    match baseline_snapshot(&snaps, as_of) {
        Some(b) => println!("baseline_date={} baseline_equity={}", b.snapshot_date, b.total_equity),
        None => println!("baseline_date=NONE"),
    }
    print_performance(&report);
    Ok(())
}

pub fn print_performance(r: &PerformanceReport) {
    println!("as_of={}", r.as_of);
    println!("periods={}", r.periods.len());
    horizon("wtd", &r.wtd);
    horizon("mtd", &r.mtd);
    horizon("ytd", &r.ytd);
    horizon("week52", &r.week52);
    horizon("lifetime", &r.lifetime);
    println!("fy_run_rate={}", pct(r.fy_run_rate));
    println!("days_elapsed={}", r.days_elapsed);
}

fn horizon(name: &str, h: &HorizonReturn) {
    println!(
        "{name}_return={} {name}_profit={} {name}_periods={}",
        pct(h.return_rate),
        h.profit,
        h.periods
    );
}

fn pct(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}
