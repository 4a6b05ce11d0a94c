use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use otr_portfolio::{Micros, PortfolioSnapshot};
use sqlx::PgPool;
use uuid::Uuid;

/// Insert or replace the owner's snapshot for `date`. Calling it twice for the
/// same day leaves a single row holding the latest values.
pub async fn upsert_snapshot(
    pool: &PgPool,
    owner: Uuid,
    date: NaiveDate,
    total_equity: Micros,
    exchange_rate: f64,
) -> Result<PortfolioSnapshot> {
    if !(exchange_rate.is_finite() && exchange_rate > 0.0) {
        bail!("upsert_snapshot: exchange_rate must be positive, got {exchange_rate}");
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into portfolio_snapshots (owner_id, snapshot_date, total_equity_micros, exchange_rate)
        values ($1, $2, $3, $4)
        on conflict (owner_id, snapshot_date) do update set
          total_equity_micros = excluded.total_equity_micros,
          exchange_rate = excluded.exchange_rate
        returning id
        "#,
    )
    .bind(owner)
    .bind(date)
    .bind(total_equity.raw())
    .bind(exchange_rate)
    .fetch_one(pool)
    .await
    .context("upsert_snapshot failed")?;

    Ok(PortfolioSnapshot {
        id,
        owner_id: owner,
        snapshot_date: date,
        total_equity,
        exchange_rate,
    })
}

/// All snapshots for the owner, oldest first.
pub async fn list_snapshots(pool: &PgPool, owner: Uuid) -> Result<Vec<PortfolioSnapshot>> {
    let rows: Vec<(i64, NaiveDate, i64, f64)> = sqlx::query_as(
        r#"
        select id, snapshot_date, total_equity_micros, exchange_rate
        from portfolio_snapshots
        where owner_id = $1
        order by snapshot_date
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await
    .context("list_snapshots failed")?;

    Ok(rows
        .into_iter()
        .map(|(id, snapshot_date, equity, exchange_rate)| PortfolioSnapshot {
            id,
            owner_id: owner,
            snapshot_date,
            total_equity: Micros::new(equity),
            exchange_rate,
        })
        .collect())
}
