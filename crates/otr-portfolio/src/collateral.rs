//! Collateral resolution for covered calls.
//!
//! Each long STOCK row on a symbol offers its share count, each long
//! LEAP_CALL row its contract count. One short call contract consumes 100
//! shares or one LEAP contract. Coverage is resolved in two passes:
//!
//! 1. Open call lots with an explicit `linked_asset_id` subtract from that row.
//! 2. Unlinked open call lots are covered stock-first, then LEAP, each group
//!    oldest `(date_acquired, id)` first.
//!
//! Whatever remains is offered as available collateral.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::book::PortfolioBook;
use crate::fixedpoint::Micros;
use crate::types::{InstrumentType, LongPosition, RowId, OPTION_MULTIPLIER};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollateralKind {
    Shares,
    LongOption,
}

impl CollateralKind {
    /// Units of this collateral consumed by one short call contract.
    pub fn units_per_contract(self) -> i64 {
        match self {
            CollateralKind::Shares => OPTION_MULTIPLIER,
            CollateralKind::LongOption => 1,
        }
    }

    fn of(instrument: InstrumentType) -> Option<CollateralKind> {
        match instrument {
            InstrumentType::Stock => Some(CollateralKind::Shares),
            InstrumentType::LeapCall => Some(CollateralKind::LongOption),
            InstrumentType::LeapPut => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollateralSlot {
    pub position_id: RowId,
    pub symbol: String,
    pub kind: CollateralKind,
    pub strike: Option<Micros>,
    pub expiration: Option<NaiveDate>,
    /// Shares (stock) or contracts (LEAP) not yet pledged.
    pub available_units: i64,
}

impl CollateralSlot {
    /// Whole short contracts this slot can still cover.
    pub fn coverable_contracts(&self) -> i64 {
        self.available_units / self.kind.units_per_contract()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollateralError {
    PositionNotFound { id: RowId },
    /// The row cannot back a call (flat, short, or a LEAP put).
    NotCollateral { id: RowId },
    SymbolMismatch {
        id: RowId,
        expected: String,
        found: String,
    },
    Insufficient {
        position_id: RowId,
        available_contracts: i64,
        requested: i64,
    },
}

impl std::fmt::Display for CollateralError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionNotFound { id } => write!(f, "collateral position {id} not found"),
            Self::NotCollateral { id } => {
                write!(f, "position {id} cannot be pledged as call collateral")
            }
            Self::SymbolMismatch {
                id,
                expected,
                found,
            } => write!(
                f,
                "position {id} is {found}, cannot cover a call on {expected}"
            ),
            Self::Insufficient {
                position_id,
                available_contracts,
                requested,
            } => write!(
                f,
                "position {position_id} covers {available_contracts} more contracts, {requested} requested"
            ),
        }
    }
}

impl std::error::Error for CollateralError {}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

struct Slot<'a> {
    pos: &'a LongPosition,
    kind: CollateralKind,
    units: i64,
}

fn resolve<'a>(book: &'a PortfolioBook, symbol: &str) -> Vec<Slot<'a>> {
    let mut stock: Vec<Slot<'a>> = Vec::new();
    let mut leaps: Vec<Slot<'a>> = Vec::new();
    for pos in book.longs().held_for_symbol(symbol) {
        let Some(kind) = CollateralKind::of(pos.instrument_type) else {
            continue;
        };
        let slot = Slot {
            pos,
            kind,
            units: pos.quantity,
        };
        match kind {
            CollateralKind::Shares => stock.push(slot),
            CollateralKind::LongOption => leaps.push(slot),
        }
    }

    let calls = book.shorts().open_calls(symbol);

    // Pass 1: explicit links.
    let mut unlinked = Vec::new();
    for lot in &calls {
        let linked = match lot.linked_asset_id {
            Some(id) => stock
                .iter_mut()
                .chain(leaps.iter_mut())
                .find(|s| s.pos.id == id),
            None => None,
        };
        match linked {
            Some(slot) => {
                let used = lot.contracts.saturating_mul(slot.kind.units_per_contract());
                slot.units = slot.units.saturating_sub(used);
            }
            None => unlinked.push(*lot),
        }
    }

    // Pass 2: unlinked calls, stock first then LEAP, oldest first.
    for lot in unlinked {
        let mut need = lot.contracts;
        for slot in stock.iter_mut().chain(leaps.iter_mut()) {
            if need <= 0 {
                break;
            }
            let per = slot.kind.units_per_contract();
            let can = (slot.units / per).max(0);
            let take = can.min(need);
            slot.units -= take * per;
            need -= take;
        }
    }

    stock.into_iter().chain(leaps).collect()
}

/// Long rows on `symbol` that can still back new short calls.
pub fn available_collateral(book: &PortfolioBook, symbol: &str) -> Vec<CollateralSlot> {
    resolve(book, symbol)
        .into_iter()
        .filter(|s| s.units > 0)
        .map(|s| CollateralSlot {
            position_id: s.pos.id,
            symbol: s.pos.symbol.clone(),
            kind: s.kind,
            strike: s.pos.strike,
            expiration: s.pos.expiration,
            available_units: s.units,
        })
        .collect()
}

/// Contracts explicitly linked to each long row across all open call lots.
pub fn locked_collateral(book: &PortfolioBook) -> BTreeMap<RowId, i64> {
    let mut out = BTreeMap::new();
    for lot in book.shorts().open_lots() {
        if let Some(id) = lot.linked_asset_id {
            *out.entry(id).or_insert(0) += lot.contracts;
        }
    }
    out
}

/// Check that `position_id` can back `contracts` new short calls on `symbol`,
/// accounting for every open lot already drawing on it.
pub fn validate_collateral(
    book: &PortfolioBook,
    position_id: RowId,
    symbol: &str,
    contracts: i64,
) -> Result<CollateralSlot, CollateralError> {
    let pos = book
        .longs()
        .get(position_id)
        .ok_or(CollateralError::PositionNotFound { id: position_id })?;
    if pos.symbol != symbol {
        return Err(CollateralError::SymbolMismatch {
            id: position_id,
            expected: symbol.to_string(),
            found: pos.symbol.clone(),
        });
    }
    if pos.quantity <= 0 || CollateralKind::of(pos.instrument_type).is_none() {
        return Err(CollateralError::NotCollateral { id: position_id });
    }

    let slot = available_collateral(book, symbol)
        .into_iter()
        .find(|s| s.position_id == position_id);
    let available_contracts = slot.as_ref().map_or(0, |s| s.coverable_contracts());
    match slot {
        Some(slot) if available_contracts >= contracts => Ok(slot),
        _ => Err(CollateralError::Insufficient {
            position_id,
            available_contracts,
            requested: contracts,
        }),
    }
}

/// Default link for a new short call: the first row, stock before LEAP and
/// oldest first, with enough unpledged units for all `contracts`. `None`
/// leaves the lot unlinked.
pub fn default_call_collateral(
    book: &PortfolioBook,
    symbol: &str,
    contracts: i64,
) -> Option<RowId> {
    available_collateral(book, symbol)
        .into_iter()
        .find(|s| s.coverable_contracts() >= contracts)
        .map(|s| s.position_id)
}
