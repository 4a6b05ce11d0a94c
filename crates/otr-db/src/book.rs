//! Loading an owner's book and persisting its journal.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use otr_portfolio::{
    Currency, InstrumentType, Journal, LedgerEntry, LedgerKind, LongPosition, LotStatus, Micros,
    OptionType, PortfolioBook, ShortOptionLot, Side,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub ledger_inserted: u64,
    pub ledger_deleted: u64,
    pub longs_upserted: u64,
    pub shorts_upserted: u64,
    pub shorts_deleted: u64,
}

/// Load every row the owner has into a [`PortfolioBook`].
pub async fn load_book(pool: &PgPool, owner: Uuid) -> Result<PortfolioBook> {
    let entries = sqlx::query(
        r#"
        select owner_id, id, entry_date, amount_micros, currency, kind, related_symbol,
               description, group_id, side, quantity, fees_micros, position_id, lot_effects
        from ledger_entries
        where owner_id = $1
        order by id
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await
    .context("load ledger_entries failed")?
    .iter()
    .map(ledger_from_row)
    .collect::<Result<Vec<_>>>()?;

    let positions = sqlx::query(
        r#"
        select owner_id, id, symbol, instrument_type, quantity, cost_basis_micros, expiration,
               strike_micros, last_manual_price_micros, date_acquired
        from long_positions
        where owner_id = $1
        order by id
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await
    .context("load long_positions failed")?
    .iter()
    .map(long_from_row)
    .collect::<Result<Vec<_>>>()?;

    let lots = sqlx::query(
        r#"
        select owner_id, id, symbol, option_type, strike_micros, expiration, contracts,
               premium_received_micros, open_date, status, linked_asset_id, group_id,
               closing_price_micros, closed_date
        from short_option_lots
        where owner_id = $1
        order by id
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await
    .context("load short_option_lots failed")?
    .iter()
    .map(short_from_row)
    .collect::<Result<Vec<_>>>()?;

    PortfolioBook::from_parts(owner, entries, positions, lots)
        .map_err(|e| anyhow!("stored book for owner={owner} is inconsistent: {e}"))
}

/// Apply a journal in one transaction: ledger deletes, long upserts, short
/// deletes, short upserts, then ledger inserts. Nothing is written if any
/// statement fails.
pub async fn commit_journal(pool: &PgPool, journal: &Journal) -> Result<CommitStats> {
    let mut stats = CommitStats::default();
    if journal.is_empty() {
        return Ok(stats);
    }
    let owner = journal.owner_id;

    let mut tx = pool.begin().await.context("commit_journal begin failed")?;

    if !journal.ledger_deletes.is_empty() {
        let res = sqlx::query("delete from ledger_entries where owner_id = $1 and id = any($2)")
            .bind(owner)
            .bind(journal.ledger_deletes.as_slice())
            .execute(&mut *tx)
            .await
            .context("delete ledger_entries failed")?;
        stats.ledger_deleted = res.rows_affected();
    }

    for p in &journal.long_upserts {
        upsert_long(&mut tx, p).await?;
        stats.longs_upserted += 1;
    }
    if !journal.short_deletes.is_empty() {
        let res = sqlx::query("delete from short_option_lots where owner_id = $1 and id = any($2)")
            .bind(owner)
            .bind(journal.short_deletes.as_slice())
            .execute(&mut *tx)
            .await
            .context("delete short_option_lots failed")?;
        stats.shorts_deleted = res.rows_affected();
    }
    for l in &journal.short_upserts {
        upsert_short(&mut tx, l).await?;
        stats.shorts_upserted += 1;
    }
    for e in &journal.ledger_inserts {
        insert_ledger(&mut tx, e).await?;
        stats.ledger_inserted += 1;
    }

    tx.commit().await.context("commit_journal commit failed")?;

    info!(
        owner = %owner,
        ledger_inserted = stats.ledger_inserted,
        ledger_deleted = stats.ledger_deleted,
        longs = stats.longs_upserted,
        shorts = stats.shorts_upserted,
        shorts_deleted = stats.shorts_deleted,
        "journal committed"
    );
    Ok(stats)
}

async fn insert_ledger(tx: &mut Transaction<'_, Postgres>, e: &LedgerEntry) -> Result<()> {
    let effects = serde_json::to_value(&e.lot_effects)
        .with_context(|| format!("serialize lot_effects of ledger id={} failed", e.id))?;
    sqlx::query(
        r#"
        insert into ledger_entries (
          owner_id, id, entry_date, amount_micros, currency, kind, related_symbol,
          description, group_id, side, quantity, fees_micros, position_id, lot_effects
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(e.owner_id)
    .bind(e.id)
    .bind(e.date)
    .bind(e.amount.raw())
    .bind(e.currency.as_str())
    .bind(e.kind.as_str())
    .bind(&e.related_symbol)
    .bind(&e.description)
    .bind(e.group_id)
    .bind(e.side.map(side_str))
    .bind(e.quantity)
    .bind(e.fees.raw())
    .bind(e.position_id)
    .bind(effects)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert ledger_entries id={} failed", e.id))?;
    Ok(())
}

async fn upsert_long(tx: &mut Transaction<'_, Postgres>, p: &LongPosition) -> Result<()> {
    sqlx::query(
        r#"
        insert into long_positions (
          owner_id, id, symbol, instrument_type, quantity, cost_basis_micros, expiration,
          strike_micros, last_manual_price_micros, date_acquired
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        on conflict (owner_id, id) do update set
          quantity = excluded.quantity,
          cost_basis_micros = excluded.cost_basis_micros,
          last_manual_price_micros = excluded.last_manual_price_micros,
          date_acquired = excluded.date_acquired
        "#,
    )
    .bind(p.owner_id)
    .bind(p.id)
    .bind(&p.symbol)
    .bind(p.instrument_type.as_str())
    .bind(p.quantity)
    .bind(p.cost_basis.raw())
    .bind(p.expiration)
    .bind(p.strike.map(Micros::raw))
    .bind(p.last_manual_price.map(Micros::raw))
    .bind(p.date_acquired)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("upsert long_positions id={} failed", p.id))?;
    Ok(())
}

async fn upsert_short(tx: &mut Transaction<'_, Postgres>, l: &ShortOptionLot) -> Result<()> {
    sqlx::query(
        r#"
        insert into short_option_lots (
          owner_id, id, symbol, option_type, strike_micros, expiration, contracts,
          premium_received_micros, open_date, status, linked_asset_id, group_id,
          closing_price_micros, closed_date
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        on conflict (owner_id, id) do update set
          contracts = excluded.contracts,
          status = excluded.status,
          linked_asset_id = excluded.linked_asset_id,
          group_id = excluded.group_id,
          closing_price_micros = excluded.closing_price_micros,
          closed_date = excluded.closed_date
        "#,
    )
    .bind(l.owner_id)
    .bind(l.id)
    .bind(&l.symbol)
    .bind(l.option_type.as_str())
    .bind(l.strike.raw())
    .bind(l.expiration)
    .bind(l.contracts)
    .bind(l.premium_received.raw())
    .bind(l.open_date)
    .bind(l.status.as_str())
    .bind(l.linked_asset_id)
    .bind(l.group_id)
    .bind(l.closing_price.map(Micros::raw))
    .bind(l.closed_date)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("upsert short_option_lots id={} failed", l.id))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn parse_col<T>(column: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    parse(raw).ok_or_else(|| anyhow!("invalid value '{raw}' in column {column}"))
}

fn ledger_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let side: Option<String> = row.try_get("side")?;
    let effects: serde_json::Value = row.try_get("lot_effects")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        date: row.try_get::<NaiveDate, _>("entry_date")?,
        amount: Micros::new(row.try_get("amount_micros")?),
        currency: parse_col("currency", row.try_get("currency")?, Currency::parse)?,
        kind: parse_col("kind", row.try_get("kind")?, LedgerKind::parse)?,
        related_symbol: row.try_get("related_symbol")?,
        description: row.try_get("description")?,
        group_id: row.try_get("group_id")?,
        side: side
            .as_deref()
            .map(|s| parse_col("side", s, Side::parse))
            .transpose()?,
        quantity: row.try_get("quantity")?,
        fees: Micros::new(row.try_get("fees_micros")?),
        position_id: row.try_get("position_id")?,
        lot_effects: serde_json::from_value(effects).context("invalid value in column lot_effects")?,
    })
}

fn long_from_row(row: &PgRow) -> Result<LongPosition> {
    Ok(LongPosition {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        symbol: row.try_get("symbol")?,
        instrument_type: parse_col(
            "instrument_type",
            row.try_get("instrument_type")?,
            InstrumentType::parse,
        )?,
        quantity: row.try_get("quantity")?,
        cost_basis: Micros::new(row.try_get("cost_basis_micros")?),
        expiration: row.try_get("expiration")?,
        strike: row.try_get::<Option<i64>, _>("strike_micros")?.map(Micros::new),
        last_manual_price: row
            .try_get::<Option<i64>, _>("last_manual_price_micros")?
            .map(Micros::new),
        date_acquired: row.try_get("date_acquired")?,
    })
}

fn short_from_row(row: &PgRow) -> Result<ShortOptionLot> {
    Ok(ShortOptionLot {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        symbol: row.try_get("symbol")?,
        option_type: parse_col("option_type", row.try_get("option_type")?, OptionType::parse)?,
        strike: Micros::new(row.try_get("strike_micros")?),
        expiration: row.try_get("expiration")?,
        contracts: row.try_get("contracts")?,
        premium_received: Micros::new(row.try_get("premium_received_micros")?),
        open_date: row.try_get("open_date")?,
        status: parse_col("status", row.try_get("status")?, LotStatus::parse)?,
        linked_asset_id: row.try_get("linked_asset_id")?,
        group_id: row.try_get("group_id")?,
        closing_price: row
            .try_get::<Option<i64>, _>("closing_price_micros")?
            .map(Micros::new),
        closed_date: row.try_get("closed_date")?,
    })
}
