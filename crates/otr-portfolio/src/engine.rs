//! Trade reconciliation engine.
//!
//! Turns trade and cash events into ledger entries and position/lot
//! mutations on a [`PortfolioBook`]. Every operation:
//!
//! - refuses read-only sessions before touching anything;
//! - validates its input;
//! - runs as one unit on the book (an error leaves the book unchanged);
//! - returns a [`TradeReport`] with the entries written and a
//!   [`FillOutcome`] describing any data inconsistency.
//!
//! Missing short lots and over-sold positions are not errors: they are
//! reported as [`FillOutcome::PartialFill`] / [`FillOutcome::Inconsistent`]
//! and logged with `warn!`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::access::AccessContext;
use crate::book::PortfolioBook;
use crate::collateral::{default_call_collateral, validate_collateral, CollateralError};
use crate::fixedpoint::Micros;
use crate::ledger::LedgerError;
use crate::positions::{PositionError, PositionFill};
use crate::shorts::{ConsumeMode, Consumption, Termination};
use crate::types::{
    Currency, LedgerEntry, LedgerKind, LotEffect, LotStatus, OptionType, PositionKey, RowId,
    ShortOptionLot, Side, OPTION_MULTIPLIER,
};

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The session may read this portfolio but not write it.
    ReadOnly { owner_id: Uuid, actor_id: Uuid },
    /// The context names a different owner than the book.
    OwnerMismatch { context: Uuid, book: Uuid },
    InvalidInput(String),
    EntryNotFound { id: RowId },
    LotNotFound { id: RowId },
    LotNotOpen { id: RowId, status: LotStatus },
    Ledger(LedgerError),
    Position(PositionError),
    Collateral(CollateralError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly { owner_id, actor_id } => write!(
                f,
                "read-only access: {actor_id} cannot modify portfolio {owner_id}"
            ),
            Self::OwnerMismatch { context, book } => {
                write!(f, "session owner {context} does not match book owner {book}")
            }
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::EntryNotFound { id } => write!(f, "ledger entry {id} not found"),
            Self::LotNotFound { id } => write!(f, "short lot {id} not found"),
            Self::LotNotOpen { id, status } => {
                write!(f, "short lot {id} is {}, not OPEN", status.as_str())
            }
            Self::Ledger(e) => write!(f, "{e}"),
            Self::Position(e) => write!(f, "{e}"),
            Self::Collateral(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::Ledger(e)
    }
}

impl From<PositionError> for EngineError {
    fn from(e: PositionError) -> Self {
        EngineError::Position(e)
    }
}

impl From<CollateralError> for EngineError {
    fn from(e: CollateralError) -> Self {
        EngineError::Collateral(e)
    }
}

/// Data-consistency result of an applied operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FillOutcome {
    Ok,
    /// Fewer open contracts matched than requested.
    PartialFill { requested: i64, filled: i64 },
    /// The operation left the book in a state the user should review.
    Inconsistent { detail: String },
}

impl FillOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, FillOutcome::Ok)
    }

    fn severity(&self) -> u8 {
        match self {
            FillOutcome::Ok => 0,
            FillOutcome::PartialFill { .. } => 1,
            FillOutcome::Inconsistent { .. } => 2,
        }
    }

    /// Keep the more severe of two outcomes.
    pub fn merge(self, other: FillOutcome) -> FillOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TradeReport {
    pub entries: Vec<LedgerEntry>,
    pub fill: FillOutcome,
    pub group_id: Option<Uuid>,
    /// Long position written, if any.
    pub position_id: Option<RowId>,
    /// Short lots inserted or updated.
    pub lot_ids: Vec<RowId>,
}

impl TradeReport {
    fn new(group_id: Option<Uuid>) -> Self {
        Self {
            entries: Vec::new(),
            fill: FillOutcome::Ok,
            group_id,
            position_id: None,
            lot_ids: Vec::new(),
        }
    }

    /// Sum of all entry amounts in USD.
    pub fn net_cash(&self) -> Micros {
        self.entries
            .iter()
            .filter(|e| e.currency == Currency::Usd)
            .map(|e| e.amount)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTrade {
    pub symbol: String,
    pub quantity: i64,
    pub price: Micros,
    pub side: Side,
    pub date: NaiveDate,
    #[serde(default)]
    pub fees: Micros,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTerms {
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: Micros,
    pub expiration: NaiveDate,
}

impl OptionTerms {
    fn label(&self) -> String {
        format!(
            "{} {} ${} {}",
            self.symbol,
            self.expiration,
            money(self.strike),
            self.option_type.as_str()
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongOptionTrade {
    #[serde(flatten)]
    pub terms: OptionTerms,
    pub contracts: i64,
    pub premium: Micros,
    pub side: Side,
    pub date: NaiveDate,
    #[serde(default)]
    pub fees: Micros,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortOptionTrade {
    #[serde(flatten)]
    pub terms: OptionTerms,
    pub contracts: i64,
    pub premium: Micros,
    /// Sell opens a lot, Buy closes lots.
    pub side: Side,
    pub date: NaiveDate,
    #[serde(default)]
    pub fees: Micros,
    #[serde(default)]
    pub collateral_override: Option<RowId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub lot_id: RowId,
    pub contracts: i64,
    pub date: NaiveDate,
}

/// Assignment spread over every open lot matching the terms, FIFO.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkAssignment {
    #[serde(flatten)]
    pub terms: OptionTerms,
    pub contracts: i64,
    pub date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    #[serde(flatten)]
    pub terms: OptionTerms,
    pub contracts: i64,
    pub date: NaiveDate,
    #[serde(default)]
    pub fees: Micros,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roll {
    pub symbol: String,
    pub option_type: OptionType,
    pub contracts: i64,
    pub old_strike: Micros,
    pub old_expiration: NaiveDate,
    pub btc_price: Micros,
    pub new_strike: Micros,
    pub new_expiration: NaiveDate,
    pub new_premium: Micros,
    #[serde(default)]
    pub fees: Micros,
    pub date: NaiveDate,
    #[serde(default)]
    pub collateral_override: Option<RowId>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashKind {
    Deposit,
    Withdrawal,
    Dividend,
    InterestReceived,
    InterestPaid,
}

impl CashKind {
    pub fn parse(s: &str) -> Option<CashKind> {
        match s.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
            "deposit" => Some(CashKind::Deposit),
            "withdrawal" => Some(CashKind::Withdrawal),
            "dividend" => Some(CashKind::Dividend),
            "interest" | "interest_received" => Some(CashKind::InterestReceived),
            "interest_paid" => Some(CashKind::InterestPaid),
            _ => None,
        }
    }

    fn ledger_kind(self) -> LedgerKind {
        match self {
            CashKind::Deposit => LedgerKind::Deposit,
            CashKind::Withdrawal => LedgerKind::Withdrawal,
            CashKind::Dividend => LedgerKind::Dividend,
            CashKind::InterestReceived | CashKind::InterestPaid => LedgerKind::Interest,
        }
    }

    fn is_outflow(self) -> bool {
        matches!(self, CashKind::Withdrawal | CashKind::InterestPaid)
    }

    fn label(self) -> &'static str {
        match self {
            CashKind::Deposit => "Deposit",
            CashKind::Withdrawal => "Withdrawal",
            CashKind::Dividend => "Dividend",
            CashKind::InterestReceived => "Interest received",
            CashKind::InterestPaid => "Interest paid",
        }
    }
}

/// External cash movement. `amount` is a positive magnitude; the sign comes
/// from `kind`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashMovement {
    pub kind: CashKind,
    pub amount: Micros,
    /// CAD actually sent or received, for deposits and withdrawals.
    #[serde(default)]
    pub amount_cad_basis: Option<Micros>,
    #[serde(default)]
    pub symbol: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn money(m: Micros) -> String {
    format!("{:.2}", m.to_f64())
}

fn with_fees(mut desc: String, fees: Micros) -> String {
    if fees.is_positive() {
        desc.push_str(&format!(" (Fees: ${})", money(fees)));
    }
    desc
}

fn authorize(ctx: &AccessContext, book: &PortfolioBook) -> Result<(), EngineError> {
    if ctx.owner_id != book.owner_id() {
        return Err(EngineError::OwnerMismatch {
            context: ctx.owner_id,
            book: book.owner_id(),
        });
    }
    if ctx.is_read_only() {
        return Err(EngineError::ReadOnly {
            owner_id: ctx.owner_id,
            actor_id: ctx.actor_id,
        });
    }
    Ok(())
}

fn clean_symbol(raw: &str) -> Result<String, EngineError> {
    let s = raw.trim().to_ascii_uppercase();
    if s.is_empty() {
        return Err(EngineError::InvalidInput("symbol must not be empty".into()));
    }
    Ok(s)
}

fn check_positive(value: i64, what: &str) -> Result<(), EngineError> {
    if value <= 0 {
        return Err(EngineError::InvalidInput(format!(
            "{what} must be > 0, got {value}"
        )));
    }
    Ok(())
}

fn check_non_negative(value: Micros, what: &str) -> Result<(), EngineError> {
    if value.is_negative() {
        return Err(EngineError::InvalidInput(format!(
            "{what} must be >= 0, got {value}"
        )));
    }
    Ok(())
}

fn clean_terms(terms: &OptionTerms) -> Result<OptionTerms, EngineError> {
    check_non_negative(terms.strike, "strike")?;
    Ok(OptionTerms {
        symbol: clean_symbol(&terms.symbol)?,
        ..terms.clone()
    })
}

/// Signed cash for `units * price * multiplier` with fees on top.
fn trade_cash(side: Side, units: i64, price: Micros, multiplier: i64, fees: Micros) -> Micros {
    let gross = price.mul_qty(units).mul_qty(multiplier);
    match side {
        Side::Buy => -(gross.saturating_add(fees)),
        Side::Sell => gross.saturating_sub(fees),
    }
}

struct EntryDraft {
    date: NaiveDate,
    amount: Micros,
    currency: Currency,
    kind: LedgerKind,
    symbol: Option<String>,
    description: String,
    group_id: Option<Uuid>,
    side: Option<Side>,
    quantity: Option<i64>,
    fees: Micros,
    position_id: Option<RowId>,
    lot_effects: Vec<LotEffect>,
}

impl EntryDraft {
    fn new(date: NaiveDate, kind: LedgerKind, amount: Micros, description: String) -> Self {
        Self {
            date,
            amount,
            currency: Currency::Usd,
            kind,
            symbol: None,
            description,
            group_id: None,
            side: None,
            quantity: None,
            fees: Micros::ZERO,
            position_id: None,
            lot_effects: Vec::new(),
        }
    }
}

fn write_entry(book: &mut PortfolioBook, draft: EntryDraft) -> Result<LedgerEntry, EngineError> {
    let entry = LedgerEntry {
        id: book.alloc_ledger_id(),
        owner_id: book.owner_id(),
        date: draft.date,
        amount: draft.amount,
        currency: draft.currency,
        kind: draft.kind,
        related_symbol: draft.symbol,
        description: draft.description,
        group_id: draft.group_id,
        side: draft.side,
        quantity: draft.quantity,
        fees: draft.fees,
        position_id: draft.position_id,
        lot_effects: draft.lot_effects,
    };
    book.append_entry(entry.clone())?;
    Ok(entry)
}

/// Apply one STOCK / LEAP fill plus its ledger entry.
fn position_trade(
    book: &mut PortfolioBook,
    key: PositionKey,
    fill: PositionFill,
    description: String,
    group_id: Option<Uuid>,
    report: &mut TradeReport,
) -> Result<(), EngineError> {
    let multiplier = key.instrument_type.multiplier();
    let amount = trade_cash(fill.side, fill.quantity, fill.price, multiplier, fill.fees);
    let owner = book.owner_id();
    let new_id = book.alloc_long_id();
    let change = book.longs_mut().apply_fill(owner, &key, &fill, new_id);
    book.touch_long(change.position_id);

    let entry = write_entry(
        book,
        EntryDraft {
            symbol: Some(key.symbol.clone()),
            group_id,
            side: Some(fill.side),
            quantity: Some(fill.quantity),
            fees: fill.fees,
            position_id: Some(change.position_id),
            ..EntryDraft::new(fill.date, key.instrument_type.ledger_kind(), amount, description)
        },
    )?;

    if change.quantity_after < 0 {
        warn!(
            owner = %owner,
            symbol = %key.symbol,
            instrument = key.instrument_type.as_str(),
            quantity = change.quantity_after,
            "sell exceeded holdings; position is now negative"
        );
        report.fill = report.fill.clone().merge(FillOutcome::Inconsistent {
            detail: format!(
                "{} {} quantity is negative ({})",
                key.symbol,
                key.instrument_type.as_str(),
                change.quantity_after
            ),
        });
    }
    report.position_id = Some(change.position_id);
    report.entries.push(entry);
    Ok(())
}

fn partial(report: &mut TradeReport, what: &str, requested: i64, filled: i64) {
    if filled < requested {
        warn!(
            requested,
            filled,
            "{what}: fewer open short contracts than requested"
        );
        report.fill = report
            .fill
            .clone()
            .merge(FillOutcome::PartialFill { requested, filled });
    }
}

fn lot_list(c: &Consumption) -> String {
    c.lots
        .iter()
        .map(|l| l.lot_id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Stock and long options
// ---------------------------------------------------------------------------

/// Buy or sell shares; Buy capitalises fees into the average cost.
pub fn record_stock_trade(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    t: &StockTrade,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let symbol = clean_symbol(&t.symbol)?;
    check_positive(t.quantity, "quantity")?;
    check_non_negative(t.price, "price")?;
    check_non_negative(t.fees, "fees")?;

    book.transact(|book| {
        let mut report = TradeReport::new(None);
        let description = with_fees(
            format!(
                "{} {} {} @ ${}",
                t.side.as_str(),
                t.quantity,
                symbol,
                money(t.price)
            ),
            t.fees,
        );
        position_trade(
            book,
            PositionKey::stock(&symbol),
            PositionFill {
                side: t.side,
                quantity: t.quantity,
                price: t.price,
                fees: t.fees,
                date: t.date,
            },
            description,
            None,
            &mut report,
        )?;
        Ok(report)
    })
}

/// Buy or sell long (LEAP) contracts; premium is quoted per share.
pub fn record_long_option_trade(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    t: &LongOptionTrade,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let terms = clean_terms(&t.terms)?;
    check_positive(t.contracts, "contracts")?;
    check_non_negative(t.premium, "premium")?;
    check_non_negative(t.fees, "fees")?;

    book.transact(|book| {
        let mut report = TradeReport::new(None);
        let description = with_fees(
            format!(
                "{} {} {} @ ${}",
                t.side.as_str(),
                t.contracts,
                terms.label(),
                money(t.premium)
            ),
            t.fees,
        );
        position_trade(
            book,
            PositionKey::option(
                &terms.symbol,
                terms.option_type,
                terms.strike,
                terms.expiration,
            ),
            PositionFill {
                side: t.side,
                quantity: t.contracts,
                price: t.premium,
                fees: t.fees,
                date: t.date,
            },
            description,
            None,
            &mut report,
        )?;
        Ok(report)
    })
}

// ---------------------------------------------------------------------------
// Short options
// ---------------------------------------------------------------------------

fn resolve_link(
    book: &PortfolioBook,
    terms: &OptionTerms,
    contracts: i64,
    explicit: Option<RowId>,
    inherited: Option<RowId>,
) -> Result<Option<RowId>, EngineError> {
    if let Some(id) = explicit {
        validate_collateral(book, id, &terms.symbol, contracts)?;
        return Ok(Some(id));
    }
    if inherited.is_some() {
        return Ok(inherited);
    }
    Ok(match terms.option_type {
        OptionType::Call => default_call_collateral(book, &terms.symbol, contracts),
        OptionType::Put => None,
    })
}

#[allow(clippy::too_many_arguments)]
fn open_short(
    book: &mut PortfolioBook,
    terms: &OptionTerms,
    contracts: i64,
    premium: Micros,
    fees: Micros,
    date: NaiveDate,
    linked_asset_id: Option<RowId>,
    group_id: Option<Uuid>,
    report: &mut TradeReport,
) -> Result<(), EngineError> {
    let lot = ShortOptionLot {
        id: book.alloc_short_id(),
        owner_id: book.owner_id(),
        symbol: terms.symbol.clone(),
        option_type: terms.option_type,
        strike: terms.strike,
        expiration: terms.expiration,
        contracts,
        premium_received: premium,
        open_date: date,
        status: LotStatus::Open,
        linked_asset_id,
        group_id,
        closing_price: None,
        closed_date: None,
    };
    let lot_id = lot.id;
    report.lot_ids.push(lot_id);
    book.insert_lot(lot);

    let amount = trade_cash(Side::Sell, contracts, premium, OPTION_MULTIPLIER, fees);
    let description = with_fees(
        format!(
            "Sell to open {} {} @ ${}",
            contracts,
            terms.label(),
            money(premium)
        ),
        fees,
    );
    let entry = write_entry(
        book,
        EntryDraft {
            symbol: Some(terms.symbol.clone()),
            group_id,
            side: Some(Side::Sell),
            quantity: Some(contracts),
            fees,
            lot_effects: vec![LotEffect::Opened { lot_id }],
            ..EntryDraft::new(date, LedgerKind::OptionPremium, amount, description)
        },
    )?;
    report.entries.push(entry);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn close_short(
    book: &mut PortfolioBook,
    terms: &OptionTerms,
    contracts: i64,
    price: Micros,
    fees: Micros,
    date: NaiveDate,
    group_id: Option<Uuid>,
    report: &mut TradeReport,
) -> Result<Consumption, EngineError> {
    let ids = book.shorts().open_matching(
        &terms.symbol,
        terms.option_type,
        terms.strike,
        terms.expiration,
    );
    let consumed = book.consume_lots(
        &ids,
        contracts,
        &Termination {
            status: LotStatus::Closed,
            mode: ConsumeMode::InPlace,
            closing_price: Some(price),
            date,
        },
    );
    report.lot_ids.extend(consumed.touched_ids());
    partial(report, "buy to close", contracts, consumed.filled);

    let amount = trade_cash(Side::Buy, contracts, price, OPTION_MULTIPLIER, fees);
    let description = with_fees(
        format!(
            "Buy to close {} {} @ ${}",
            contracts,
            terms.label(),
            money(price)
        ),
        fees,
    );
    let entry = write_entry(
        book,
        EntryDraft {
            symbol: Some(terms.symbol.clone()),
            group_id,
            side: Some(Side::Buy),
            quantity: Some(contracts),
            fees,
            lot_effects: consumed.effects(),
            ..EntryDraft::new(date, LedgerKind::OptionPremium, amount, description)
        },
    )?;
    report.entries.push(entry);
    Ok(consumed)
}

/// Sell to open a short lot, or buy to close matching lots FIFO.
pub fn record_short_option_trade(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    t: &ShortOptionTrade,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let terms = clean_terms(&t.terms)?;
    check_positive(t.contracts, "contracts")?;
    check_non_negative(t.premium, "premium")?;
    check_non_negative(t.fees, "fees")?;

    book.transact(|book| {
        let mut report = TradeReport::new(None);
        match t.side {
            Side::Sell => {
                let link = resolve_link(book, &terms, t.contracts, t.collateral_override, None)?;
                open_short(
                    book,
                    &terms,
                    t.contracts,
                    t.premium,
                    t.fees,
                    t.date,
                    link,
                    None,
                    &mut report,
                )?;
            }
            Side::Buy => {
                close_short(
                    book,
                    &terms,
                    t.contracts,
                    t.premium,
                    t.fees,
                    t.date,
                    None,
                    &mut report,
                )?;
            }
        }
        Ok(report)
    })
}

/// Write the zero expire marker and the synthesized stock leg of an assignment.
fn settle_assignment(
    book: &mut PortfolioBook,
    terms: &OptionTerms,
    consumed: &Consumption,
    date: NaiveDate,
    group_id: Uuid,
    report: &mut TradeReport,
) -> Result<(), EngineError> {
    let marker = write_entry(
        book,
        EntryDraft {
            symbol: Some(terms.symbol.clone()),
            group_id: Some(group_id),
            quantity: Some(consumed.filled),
            lot_effects: consumed.effects(),
            ..EntryDraft::new(
                date,
                LedgerKind::OptionExpire,
                Micros::ZERO,
                format!(
                    "Assigned {} {} (lots {})",
                    consumed.filled,
                    terms.label(),
                    lot_list(consumed)
                ),
            )
        },
    )?;
    report.entries.push(marker);

    let side = match terms.option_type {
        OptionType::Put => Side::Buy,
        OptionType::Call => Side::Sell,
    };
    let shares = consumed.filled.saturating_mul(OPTION_MULTIPLIER);
    position_trade(
        book,
        PositionKey::stock(&terms.symbol),
        PositionFill {
            side,
            quantity: shares,
            price: terms.strike,
            fees: Micros::ZERO,
            date,
        },
        format!(
            "Assignment: {} {} {} @ ${}",
            side.as_str(),
            shares,
            terms.symbol,
            money(terms.strike)
        ),
        Some(group_id),
        report,
    )
}

/// Assign contracts of one short lot (put: buy shares, call: sell shares at strike).
pub fn assign(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    a: &Assignment,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    check_positive(a.contracts, "contracts")?;
    let lot = book
        .shorts()
        .get(a.lot_id)
        .ok_or(EngineError::LotNotFound { id: a.lot_id })?;
    if !lot.is_open() {
        return Err(EngineError::LotNotOpen {
            id: a.lot_id,
            status: lot.status,
        });
    }
    let terms = OptionTerms {
        symbol: lot.symbol.clone(),
        option_type: lot.option_type,
        strike: lot.strike,
        expiration: lot.expiration,
    };

    book.transact(|book| {
        let group_id = Uuid::new_v4();
        let mut report = TradeReport::new(Some(group_id));
        let consumed = book.consume_lots(
            &[a.lot_id],
            a.contracts,
            &Termination {
                status: LotStatus::Assigned,
                mode: ConsumeMode::Split,
                closing_price: None,
                date: a.date,
            },
        );
        report.lot_ids.extend(consumed.touched_ids());
        partial(&mut report, "assignment", a.contracts, consumed.filled);
        settle_assignment(book, &terms, &consumed, a.date, group_id, &mut report)?;
        Ok(report)
    })
}

/// Assign `contracts` across every open lot matching the terms, FIFO.
pub fn assign_contracts(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    a: &BulkAssignment,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let terms = clean_terms(&a.terms)?;
    check_positive(a.contracts, "contracts")?;

    book.transact(|book| {
        let group_id = Uuid::new_v4();
        let mut report = TradeReport::new(Some(group_id));
        let ids = book.shorts().open_matching(
            &terms.symbol,
            terms.option_type,
            terms.strike,
            terms.expiration,
        );
        let consumed = book.consume_lots(
            &ids,
            a.contracts,
            &Termination {
                status: LotStatus::Assigned,
                mode: ConsumeMode::Split,
                closing_price: None,
                date: a.date,
            },
        );
        report.lot_ids.extend(consumed.touched_ids());
        partial(&mut report, "assignment", a.contracts, consumed.filled);
        if consumed.filled > 0 {
            settle_assignment(book, &terms, &consumed, a.date, group_id, &mut report)?;
        }
        Ok(report)
    })
}

/// Expire matching open lots FIFO; fees are booked as a separate entry.
pub fn expire(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    x: &Expiration,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let terms = clean_terms(&x.terms)?;
    check_positive(x.contracts, "contracts")?;
    check_non_negative(x.fees, "fees")?;

    book.transact(|book| {
        let group_id = Uuid::new_v4();
        let mut report = TradeReport::new(Some(group_id));
        let ids = book.shorts().open_matching(
            &terms.symbol,
            terms.option_type,
            terms.strike,
            terms.expiration,
        );
        let consumed = book.consume_lots(
            &ids,
            x.contracts,
            &Termination {
                status: LotStatus::Expired,
                mode: ConsumeMode::Split,
                closing_price: Some(Micros::ZERO),
                date: x.date,
            },
        );
        report.lot_ids.extend(consumed.touched_ids());
        partial(&mut report, "expiration", x.contracts, consumed.filled);

        if consumed.filled > 0 {
            let marker = write_entry(
                book,
                EntryDraft {
                    symbol: Some(terms.symbol.clone()),
                    group_id: Some(group_id),
                    quantity: Some(consumed.filled),
                    lot_effects: consumed.effects(),
                    ..EntryDraft::new(
                        x.date,
                        LedgerKind::OptionExpire,
                        Micros::ZERO,
                        format!(
                            "Expired {} {} (lots {})",
                            consumed.filled,
                            terms.label(),
                            lot_list(&consumed)
                        ),
                    )
                },
            )?;
            report.entries.push(marker);
        }

        if x.fees.is_positive() {
            let fee = write_entry(
                book,
                EntryDraft {
                    symbol: Some(terms.symbol.clone()),
                    group_id: Some(group_id),
                    fees: Micros::ZERO,
                    ..EntryDraft::new(
                        x.date,
                        LedgerKind::Fees,
                        -x.fees,
                        format!("Fees: expiration of {}", terms.label()),
                    )
                },
            )?;
            report.entries.push(fee);
        }
        Ok(report)
    })
}

/// Buy to close the old contract and sell to open the new one as one group.
///
/// The close leg carries all fees. The new lot inherits the collateral
/// link of the first consumed lot unless an override is given.
pub fn roll(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    r: &Roll,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let symbol = clean_symbol(&r.symbol)?;
    check_positive(r.contracts, "contracts")?;
    check_non_negative(r.btc_price, "buy-to-close price")?;
    check_non_negative(r.new_premium, "new premium")?;
    check_non_negative(r.old_strike, "old strike")?;
    check_non_negative(r.new_strike, "new strike")?;
    check_non_negative(r.fees, "fees")?;

    let old = OptionTerms {
        symbol: symbol.clone(),
        option_type: r.option_type,
        strike: r.old_strike,
        expiration: r.old_expiration,
    };
    let new = OptionTerms {
        symbol,
        option_type: r.option_type,
        strike: r.new_strike,
        expiration: r.new_expiration,
    };

    book.transact(|book| {
        let group_id = Uuid::new_v4();
        let mut report = TradeReport::new(Some(group_id));
        let consumed = close_short(
            book,
            &old,
            r.contracts,
            r.btc_price,
            r.fees,
            r.date,
            Some(group_id),
            &mut report,
        )?;
        let inherited = consumed.lots.first().and_then(|l| l.linked_asset_id);
        let link = resolve_link(book, &new, r.contracts, r.collateral_override, inherited)?;
        open_short(
            book,
            &new,
            r.contracts,
            r.new_premium,
            Micros::ZERO,
            r.date,
            link,
            Some(group_id),
            &mut report,
        )?;
        Ok(report)
    })
}

// ---------------------------------------------------------------------------
// Cash, deletion, manual prices
// ---------------------------------------------------------------------------

/// Deposit, withdrawal, dividend or interest. Deposits and withdrawals with a
/// CAD basis also write a CAD entry in the same group.
pub fn record_cash(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    c: &CashMovement,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    if !c.amount.is_positive() {
        return Err(EngineError::InvalidInput(format!(
            "cash amount must be > 0, got {}",
            c.amount
        )));
    }
    let symbol = match &c.symbol {
        Some(s) if !s.trim().is_empty() => Some(clean_symbol(s)?),
        _ => None,
    };
    let cad = c
        .amount_cad_basis
        .filter(|v| v.is_positive() && c.kind.ledger_kind().is_flow());

    book.transact(|book| {
        let group_id = cad.map(|_| Uuid::new_v4());
        let mut report = TradeReport::new(group_id);
        let sign = |m: Micros| if c.kind.is_outflow() { -m } else { m };

        let mut description = c.kind.label().to_string();
        if let Some(s) = &symbol {
            description.push_str(&format!(": {s}"));
        }
        if let Some(note) = c.note.as_deref().filter(|n| !n.trim().is_empty()) {
            description.push_str(&format!(" ({})", note.trim()));
        }

        let usd = write_entry(
            book,
            EntryDraft {
                symbol: symbol.clone(),
                group_id,
                ..EntryDraft::new(
                    c.date,
                    c.kind.ledger_kind(),
                    sign(c.amount),
                    description.clone(),
                )
            },
        )?;
        report.entries.push(usd);

        if let Some(cad_amount) = cad {
            let entry = write_entry(
                book,
                EntryDraft {
                    currency: Currency::Cad,
                    group_id,
                    ..EntryDraft::new(
                        c.date,
                        c.kind.ledger_kind(),
                        sign(cad_amount),
                        format!("{description} (CAD basis)"),
                    )
                },
            )?;
            report.entries.push(entry);
        }
        Ok(report)
    })
}

/// Delete a ledger entry and reverse its effect on long positions and short
/// lots.
///
/// Grouped entries are a unit: deleting any member deletes the whole group.
/// Members are undone newest first, so a roll removes its new lot before
/// reopening the old one.
pub fn delete_ledger_entry(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    id: RowId,
) -> Result<TradeReport, EngineError> {
    authorize(ctx, book)?;
    let target = book
        .ledger()
        .get(id)
        .ok_or(EngineError::EntryNotFound { id })?
        .clone();
    let mut ids: Vec<RowId> = match target.group_id {
        Some(g) => book.ledger().group(g).iter().map(|e| e.id).collect(),
        None => vec![id],
    };
    ids.sort_unstable_by(|a, b| b.cmp(a));

    book.transact(|book| {
        let mut report = TradeReport::new(target.group_id);
        for entry_id in ids {
            let Some(entry) = book.remove_entry(entry_id) else {
                continue;
            };
            if entry.kind.is_position_trade() {
                if let (Some(pos_id), Some(side), Some(qty)) =
                    (entry.position_id, entry.side, entry.quantity)
                {
                    let delta = match side {
                        Side::Buy => -qty,
                        Side::Sell => qty,
                    };
                    match book.longs_mut().adjust_quantity(pos_id, delta) {
                        Ok(_) => {
                            book.touch_long(pos_id);
                            report.position_id = Some(pos_id);
                        }
                        Err(e) => {
                            warn!(entry = entry.id, position = pos_id, error = %e, "reversal skipped");
                            report.fill = report.fill.clone().merge(FillOutcome::Inconsistent {
                                detail: format!(
                                    "entry {} referenced missing position {pos_id}",
                                    entry.id
                                ),
                            });
                        }
                    }
                }
            }
            for effect in &entry.lot_effects {
                reverse_lot_effect(book, entry.id, effect, &mut report);
            }
            report.entries.push(entry);
        }
        Ok(report)
    })
}

fn reverse_lot_effect(
    book: &mut PortfolioBook,
    entry_id: RowId,
    effect: &LotEffect,
    report: &mut TradeReport,
) {
    if let LotEffect::Opened { lot_id } = effect {
        if let Some(lot) = book.shorts().get(*lot_id).filter(|l| !l.is_open()) {
            warn!(
                entry = entry_id,
                lot = lot_id,
                status = lot.status.as_str(),
                "removing a lot that was already terminated"
            );
            report.fill = report.fill.clone().merge(FillOutcome::Inconsistent {
                detail: format!(
                    "entry {entry_id} opened lot {lot_id}, which is {}",
                    lot.status.as_str()
                ),
            });
        }
    }
    match book.undo_lot_effect(effect) {
        Some(undone) => {
            report.lot_ids.extend(undone.upserted);
            report.lot_ids.extend(undone.removed);
        }
        None => {
            warn!(entry = entry_id, ?effect, "lot reversal skipped");
            report.fill = report.fill.clone().merge(FillOutcome::Inconsistent {
                detail: format!("entry {entry_id} referenced a missing short lot"),
            });
        }
    }
}

/// Store a user-entered mark for a long option position.
pub fn set_manual_price(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    position_id: RowId,
    price: Micros,
) -> Result<(), EngineError> {
    authorize(ctx, book)?;
    book.transact(|book| {
        book.longs_mut().set_manual_price(position_id, price)?;
        book.touch_long(position_id);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Event dispatch
// ---------------------------------------------------------------------------

/// Any engine write, as carried by batch imports and the HTTP API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeEvent {
    Stock(StockTrade),
    LongOption(LongOptionTrade),
    ShortOption(ShortOptionTrade),
    Assign(Assignment),
    AssignBulk(BulkAssignment),
    Expire(Expiration),
    Roll(Roll),
    Cash(CashMovement),
}

impl TradeEvent {
    pub fn date(&self) -> NaiveDate {
        match self {
            TradeEvent::Stock(t) => t.date,
            TradeEvent::LongOption(t) => t.date,
            TradeEvent::ShortOption(t) => t.date,
            TradeEvent::Assign(a) => a.date,
            TradeEvent::AssignBulk(a) => a.date,
            TradeEvent::Expire(x) => x.date,
            TradeEvent::Roll(r) => r.date,
            TradeEvent::Cash(c) => c.date,
        }
    }
}

pub fn apply_event(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    event: &TradeEvent,
) -> Result<TradeReport, EngineError> {
    match event {
        TradeEvent::Stock(t) => record_stock_trade(ctx, book, t),
        TradeEvent::LongOption(t) => record_long_option_trade(ctx, book, t),
        TradeEvent::ShortOption(t) => record_short_option_trade(ctx, book, t),
        TradeEvent::Assign(a) => assign(ctx, book, a),
        TradeEvent::AssignBulk(a) => assign_contracts(ctx, book, a),
        TradeEvent::Expire(x) => expire(ctx, book, x),
        TradeEvent::Roll(r) => roll(ctx, book, r),
        TradeEvent::Cash(c) => record_cash(ctx, book, c),
    }
}
