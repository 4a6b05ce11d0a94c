//! Net liquidation value and short-call exposure.
//!
//! Reads the book plus a caller-supplied [`MarkMap`]; the book itself is
//! mark-free. A missing or zero mark falls back to the row's manual price.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::book::PortfolioBook;
use crate::fixedpoint::Micros;
use crate::types::{
    Currency, InstrumentType, LongPosition, OptionType, RowId, ShortOptionLot, OPTION_MULTIPLIER,
};

/// Canonical mark map type (symbol -> last price).
pub type MarkMap = BTreeMap<String, Micros>;

/// Helper to build a MarkMap with minimal boilerplate.
pub fn marks<I, S>(items: I) -> MarkMap
where
    I: IntoIterator<Item = (S, Micros)>,
    S: Into<String>,
{
    let mut m = MarkMap::new();
    for (sym, px) in items {
        m.insert(sym.into(), px);
    }
    m
}

/// Live mark for `symbol` if positive, else the manual price, else zero.
pub fn mark_or_manual(marks: &MarkMap, symbol: &str, manual: Option<Micros>) -> Micros {
    match marks.get(symbol) {
        Some(px) if px.is_positive() => *px,
        _ => manual.unwrap_or(Micros::ZERO),
    }
}

/// Intrinsic liability of an open short call: `(live - strike) * contracts * 100`
/// when in the money, zero otherwise. Puts are not counted.
pub fn itm_call_liability(lot: &ShortOptionLot, live: Micros) -> Micros {
    if !lot.is_open() || lot.option_type != OptionType::Call || live <= lot.strike {
        return Micros::ZERO;
    }
    (live - lot.strike)
        .mul_qty(lot.contracts)
        .mul_qty(OPTION_MULTIPLIER)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetLiquidation {
    /// USD ledger balance.
    pub cash: Micros,
    /// CAD ledger balance (CAD-basis flow entries), reported separately.
    pub cash_cad: Micros,
    pub stock_value: Micros,
    pub long_option_value: Micros,
    pub itm_call_liability: Micros,
    pub net_value: Micros,
}

/// `cash + stock + long options - ITM call liability`, all USD.
///
/// LEAP rows are valued from their manual price only.
pub fn compute_net_liquidation_value(book: &PortfolioBook, marks: &MarkMap) -> NetLiquidation {
    let cash = book.ledger().cash_balance(Currency::Usd);
    let cash_cad = book.ledger().cash_balance(Currency::Cad);

    let mut stock_value = Micros::ZERO;
    let mut long_option_value = Micros::ZERO;
    for pos in book.longs().active() {
        match pos.instrument_type {
            InstrumentType::Stock => {
                let px = mark_or_manual(marks, &pos.symbol, pos.last_manual_price);
                stock_value = stock_value.saturating_add(px.mul_qty(pos.quantity));
            }
            InstrumentType::LeapCall | InstrumentType::LeapPut => {
                let px = pos.last_manual_price.unwrap_or(Micros::ZERO);
                long_option_value = long_option_value
                    .saturating_add(px.mul_qty(pos.quantity).mul_qty(OPTION_MULTIPLIER));
            }
        }
    }

    let itm: Micros = book
        .shorts()
        .open_lots()
        .into_iter()
        .map(|lot| itm_call_liability(lot, mark_or_manual(marks, &lot.symbol, None)))
        .sum();

    NetLiquidation {
        cash,
        cash_cad,
        stock_value,
        long_option_value,
        itm_call_liability: itm,
        net_value: cash
            .saturating_add(stock_value)
            .saturating_add(long_option_value)
            .saturating_sub(itm),
    }
}

// ---------------------------------------------------------------------------
// Holdings view
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PositionValuation {
    pub position: LongPosition,
    pub mark: Micros,
    pub market_value: Micros,
    pub cost_value: Micros,
    pub unrealized: Micros,
}

/// Active long rows with mark, market value and unrealized P/L.
pub fn value_positions(book: &PortfolioBook, marks: &MarkMap) -> Vec<PositionValuation> {
    book.longs()
        .active()
        .map(|pos| {
            let mark = match pos.instrument_type {
                InstrumentType::Stock => mark_or_manual(marks, &pos.symbol, pos.last_manual_price),
                _ => pos.last_manual_price.unwrap_or(Micros::ZERO),
            };
            let mult = pos.instrument_type.multiplier();
            let market_value = mark.mul_qty(pos.quantity).mul_qty(mult);
            let cost_value = pos.cost_basis.mul_qty(pos.quantity).mul_qty(mult);
            PositionValuation {
                position: pos.clone(),
                mark,
                market_value,
                cost_value,
                unrealized: market_value.saturating_sub(cost_value),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Aggregated short view
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShortGroup {
    pub symbol: String,
    pub option_type: OptionType,
    pub expiration: NaiveDate,
    pub strike: Micros,
    pub contracts: i64,
    /// Premium collected at open, all lots, ×100.
    pub premium_collected: Micros,
    pub liability: Micros,
    /// Every lot in the group is linked to a long row.
    pub covered: bool,
    pub lot_ids: Vec<RowId>,
}

/// Open lots grouped by `(symbol, type, expiration, strike)`.
pub fn short_exposure_groups(book: &PortfolioBook, marks: &MarkMap) -> Vec<ShortGroup> {
    let mut groups: BTreeMap<(String, OptionType, NaiveDate, Micros), ShortGroup> = BTreeMap::new();
    for lot in book.shorts().open_lots() {
        let live = mark_or_manual(marks, &lot.symbol, None);
        let g = groups
            .entry((lot.symbol.clone(), lot.option_type, lot.expiration, lot.strike))
            .or_insert_with(|| ShortGroup {
                symbol: lot.symbol.clone(),
                option_type: lot.option_type,
                expiration: lot.expiration,
                strike: lot.strike,
                contracts: 0,
                premium_collected: Micros::ZERO,
                liability: Micros::ZERO,
                covered: true,
                lot_ids: Vec::new(),
            });
        g.contracts += lot.contracts;
        g.premium_collected = g.premium_collected.saturating_add(
            lot.premium_received
                .mul_qty(lot.contracts)
                .mul_qty(OPTION_MULTIPLIER),
        );
        g.liability = g.liability.saturating_add(itm_call_liability(lot, live));
        g.covered &= lot.linked_asset_id.is_some();
        g.lot_ids.push(lot.id);
    }
    groups.into_values().collect()
}
