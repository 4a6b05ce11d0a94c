//! CSV trade import.
//!
//! One file carries stocks, LEAPs, short options and cash movements. Header
//! names are case-insensitive and common broker aliases are accepted:
//!
//! | column        | aliases                          |
//! |---------------|----------------------------------|
//! | `date`        |                                  |
//! | `category`    | `type`, `class`                  |
//! | `action`      |                                  |
//! | `symbol`      | `ticker`, `stock`                |
//! | `qty`         | `quantity`, `shares`, `contracts`|
//! | `price`       | `cost`, `premium`, `amount`      |
//! | `strike`      | `strike_price`                   |
//! | `expiration`  | `expiry`, `exp`, `expiration_date`|
//! | `option_type` | `right`, `opt_type`              |
//! | `fees`        | `commission`, `comm`             |
//!
//! Rows become [`TradeEvent`]s and are applied in `(date, line)` order.

use std::io::Read;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use otr_portfolio::{
    apply_batch, apply_event, order_events, AccessContext, Assignment, BatchRowError,
    BatchSummary, BulkAssignment, CashKind, CashMovement, Expiration, LongOptionTrade, Micros,
    OptionTerms, OptionType, PortfolioBook, ShortOptionTrade, Side, StockTrade, TradeEvent,
};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{info, warn};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d-%b-%Y"];

#[derive(Debug, Default, Deserialize)]
struct RawRow {
    date: Option<String>,
    category: Option<String>,
    action: Option<String>,
    symbol: Option<String>,
    qty: Option<String>,
    price: Option<String>,
    strike: Option<String>,
    expiration: Option<String>,
    option_type: Option<String>,
    fees: Option<String>,
    /// Explicit short lot for an assignment.
    lot_id: Option<String>,
}

impl RawRow {
    fn is_blank(&self) -> bool {
        [
            &self.date,
            &self.category,
            &self.action,
            &self.symbol,
            &self.qty,
            &self.price,
        ]
        .iter()
        .all(|f| f.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Stock,
    Leap,
    Short,
    Cash,
}

/// Parsed file: events keyed by source line, plus rows that could not be read.
#[derive(Debug, Default)]
pub struct ParsedCsv {
    pub events: Vec<(usize, TradeEvent)>,
    pub errors: Vec<BatchRowError>,
}

fn canonical_header(raw: &str) -> String {
    let key = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    match key.as_str() {
        "quantity" | "shares" | "contracts" => "qty",
        "ticker" | "stock" => "symbol",
        "cost" | "premium" | "amount" => "price",
        "commission" | "comm" => "fees",
        "expiration_date" | "expiry" | "exp" => "expiration",
        "strike_price" => "strike",
        "type" | "class" => "category",
        "opt_type" | "right" => "option_type",
        "lot" => "lot_id",
        other => other,
    }
    .to_string()
}

/// Read every row; a bad row is reported and does not stop the rest.
pub fn parse_trade_csv<R: Read>(input: R) -> Result<ParsedCsv> {
    let mut rdr = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(input);

    let headers: StringRecord = rdr
        .headers()
        .context("csv header row unreadable")?
        .iter()
        .map(canonical_header)
        .collect();

    let mut out = ParsedCsv::default();
    for (i, record) in rdr.records().enumerate() {
        let line = i + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                out.errors.push(row_error(line, format!("unreadable row: {e}")));
                continue;
            }
        };
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(line);
        let raw: RawRow = match record.deserialize(Some(&headers)) {
            Ok(r) => r,
            Err(e) => {
                out.errors.push(row_error(line, format!("unreadable row: {e}")));
                continue;
            }
        };
        if raw.is_blank() {
            continue;
        }
        match row_to_event(&raw) {
            Ok(ev) => out.events.push((line, ev)),
            Err(msg) => out.errors.push(row_error(line, msg)),
        }
    }
    Ok(out)
}

fn row_error(row: usize, message: String) -> BatchRowError {
    BatchRowError { row, message }
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn text(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.split_whitespace().next().unwrap_or(raw);
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .ok_or_else(|| format!("unrecognised date '{raw}'"))
}

fn required_date(field: &Option<String>, name: &str) -> Result<NaiveDate, String> {
    parse_date(text(field).ok_or_else(|| format!("missing {name}"))?)
}

/// Absolute money value; `$` and thousands separators are ignored.
fn money(field: &Option<String>) -> Result<Micros, String> {
    match text(field) {
        None => Ok(Micros::ZERO),
        Some(raw) => Micros::parse_decimal(&raw.replace('$', ""))
            .map(Micros::abs)
            .map_err(|e| e.to_string()),
    }
}

/// Shares and contracts are whole units; fractional share lots (DRIP
/// reinvestments and the like) are rejected per row.
fn quantity(field: &Option<String>) -> Result<i64, String> {
    let raw = text(field).ok_or("missing qty")?.replace(',', "");
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(n.abs());
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 => Ok(f.abs() as i64),
        Ok(f) if f.is_finite() => Err(format!(
            "fractional qty '{raw}' is not supported; shares and contracts are whole units"
        )),
        _ => Err(format!("qty must be a whole number, got '{raw}'")),
    }
}

fn symbol(field: &Option<String>) -> Result<String, String> {
    text(field)
        .map(str::to_ascii_uppercase)
        .ok_or_else(|| "missing symbol".to_string())
}

fn category(field: &Option<String>) -> Category {
    let cat = text(field).unwrap_or("").to_ascii_uppercase();
    if cat.contains("LEAP") {
        Category::Leap
    } else if cat.contains("SHORT") || cat.contains("OPTION") {
        Category::Short
    } else if cat.contains("CASH") || cat.contains("FUND") {
        Category::Cash
    } else {
        Category::Stock
    }
}

fn side(field: &Option<String>) -> Result<Side, String> {
    match text(field) {
        None => Ok(Side::Buy),
        Some(raw) => {
            let first = raw.split_whitespace().next().unwrap_or(raw);
            Side::parse(first).ok_or_else(|| format!("unknown action '{raw}'"))
        }
    }
}

fn terms(raw: &RawRow, default_type: OptionType) -> Result<OptionTerms, String> {
    let option_type = text(&raw.option_type)
        .and_then(OptionType::parse)
        .unwrap_or(default_type);
    Ok(OptionTerms {
        symbol: symbol(&raw.symbol)?,
        option_type,
        strike: money(&raw.strike)?,
        expiration: required_date(&raw.expiration, "expiration")?,
    })
}

fn row_to_event(raw: &RawRow) -> Result<TradeEvent, String> {
    let date = required_date(&raw.date, "date")?;
    let fees = money(&raw.fees)?;
    let action = text(&raw.action).unwrap_or("").to_ascii_uppercase();

    Ok(match category(&raw.category) {
        Category::Stock => TradeEvent::Stock(StockTrade {
            symbol: symbol(&raw.symbol)?,
            quantity: quantity(&raw.qty)?,
            price: money(&raw.price)?,
            side: side(&raw.action)?,
            date,
            fees,
        }),
        Category::Leap => TradeEvent::LongOption(LongOptionTrade {
            terms: terms(raw, OptionType::Call)?,
            contracts: quantity(&raw.qty)?,
            premium: money(&raw.price)?,
            side: side(&raw.action)?,
            date,
            fees,
        }),
        Category::Short if action.starts_with("EXPIRE") => TradeEvent::Expire(Expiration {
            terms: terms(raw, OptionType::Put)?,
            contracts: quantity(&raw.qty)?,
            date,
            fees,
        }),
        Category::Short if action.starts_with("ASSIGN") => match text(&raw.lot_id) {
            Some(id) => TradeEvent::Assign(Assignment {
                lot_id: id.parse().map_err(|_| format!("lot_id must be an integer, got '{id}'"))?,
                contracts: quantity(&raw.qty)?,
                date,
            }),
            None => TradeEvent::AssignBulk(BulkAssignment {
                terms: terms(raw, OptionType::Put)?,
                contracts: quantity(&raw.qty)?,
                date,
            }),
        },
        Category::Short => TradeEvent::ShortOption(ShortOptionTrade {
            terms: terms(raw, OptionType::Put)?,
            contracts: quantity(&raw.qty)?,
            premium: money(&raw.price)?,
            side: side(&raw.action)?,
            date,
            fees,
            collateral_override: None,
        }),
        Category::Cash => {
            let kind = if action.contains("WITHDRAW") || action.contains("DEBIT") {
                CashKind::Withdrawal
            } else if action.contains("FEE") {
                return Err("FEES rows are not imported; put fees on the trade row".to_string());
            } else if action.is_empty() {
                CashKind::Deposit
            } else {
                CashKind::parse(&action)
                    .or_else(|| action.contains("DIVIDEND").then_some(CashKind::Dividend))
                    .or_else(|| action.contains("INTEREST").then_some(CashKind::InterestReceived))
                    .unwrap_or(CashKind::Deposit)
            };
            TradeEvent::Cash(CashMovement {
                kind,
                amount: money(&raw.price)?,
                amount_cad_basis: None,
                symbol: text(&raw.symbol).map(str::to_ascii_uppercase),
                date,
                note: text(&raw.action).map(|a| format!("Imported: {a}")),
            })
        }
    })
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply to a fresh in-memory book; nothing is persisted.
pub fn dry_run(ctx: &AccessContext, parsed: ParsedCsv) -> (BatchSummary, PortfolioBook) {
    let mut book = PortfolioBook::new(ctx.owner_id);
    let mut summary = apply_batch(ctx, &mut book, parsed.events);
    summary.errors.extend(parsed.errors);
    summary.errors.sort_by_key(|e| e.row);
    (summary, book)
}

/// Apply and commit row by row. A row whose commit fails is reported and the
/// book is reloaded so later rows see only what was persisted.
pub async fn commit_rows(pool: &PgPool, ctx: &AccessContext, parsed: ParsedCsv) -> Result<BatchSummary> {
    let mut book = otr_db::load_book(pool, ctx.owner_id).await?;
    let mut summary = BatchSummary::default();

    for (row, event) in order_events(parsed.events) {
        let result = apply_event(ctx, &mut book, &event);
        if result.is_ok() {
            let journal = book.take_journal();
            if let Err(e) = otr_db::commit_journal(pool, &journal).await {
                warn!(row, error = %e, "commit failed, reloading book");
                summary.fail(row, format!("commit failed: {e:#}"));
                book = otr_db::load_book(pool, ctx.owner_id).await?;
                continue;
            }
        }
        summary.record(row, result);
    }

    summary.errors.extend(parsed.errors);
    summary.errors.sort_by_key(|e| e.row);
    info!(
        owner = %ctx.owner_id,
        applied = summary.applied,
        entries = summary.entries_written,
        errors = summary.errors.len(),
        "import finished"
    );
    Ok(summary)
}

pub fn print_summary(summary: &BatchSummary) {
    println!(
        "import_applied={} entries_written={} warnings={} errors={}",
        summary.applied,
        summary.entries_written,
        summary.warnings.len(),
        summary.errors.len()
    );
    for w in &summary.warnings {
        let outcome = serde_json::to_string(&w.outcome).unwrap_or_default();
        println!("warning row={} outcome={}", w.row, outcome);
    }
    for e in &summary.errors {
        println!("error row={} message={}", e.row, e.message);
    }
}
