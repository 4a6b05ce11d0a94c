//! Long-position store: stock shares and long (LEAP) option contracts.
//!
//! One row per [`PositionKey`]; trades on the same key merge into it with a
//! weighted-average cost basis. Rows are never deleted at zero quantity,
//! they simply drop out of the active views.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::fixedpoint::{weighted_average, Micros};
use crate::types::{InstrumentType, LongPosition, PositionKey, RowId, Side};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// Two persisted rows share the same key.
    DuplicateKey { first: RowId, second: RowId },
    NotFound { id: RowId },
    /// Manual prices only apply to option positions.
    NotAnOption { id: RowId },
    NegativePrice { price: Micros },
}

impl std::fmt::Display for PositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKey { first, second } => {
                write!(f, "positions {first} and {second} share the same key")
            }
            Self::NotFound { id } => write!(f, "position {id} not found"),
            Self::NotAnOption { id } => {
                write!(f, "position {id} is not an option position")
            }
            Self::NegativePrice { price } => write!(f, "price must be >= 0, got {price}"),
        }
    }
}

impl std::error::Error for PositionError {}

/// Trade fill applied to a long position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionFill {
    pub side: Side,
    pub quantity: i64,
    pub price: Micros,
    pub fees: Micros,
    pub date: NaiveDate,
}

/// What a trade did to the keyed row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionChange {
    pub position_id: RowId,
    pub created: bool,
    pub quantity_before: i64,
    pub quantity_after: i64,
}

#[derive(Clone, Debug, Default)]
pub struct LongBook {
    rows: BTreeMap<RowId, LongPosition>,
    index: BTreeMap<PositionKey, RowId>,
}

impl LongBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<LongPosition>) -> Result<Self, PositionError> {
        let mut book = Self::new();
        for row in rows {
            let key = row.key();
            if let Some(first) = book.index.get(&key) {
                return Err(PositionError::DuplicateKey {
                    first: *first,
                    second: row.id,
                });
            }
            book.index.insert(key, row.id);
            book.rows.insert(row.id, row);
        }
        Ok(book)
    }

    pub fn get(&self, id: RowId) -> Option<&LongPosition> {
        self.rows.get(&id)
    }

    pub fn find(&self, key: &PositionKey) -> Option<&LongPosition> {
        self.index.get(key).and_then(|id| self.rows.get(id))
    }

    pub fn max_id(&self) -> RowId {
        self.rows.keys().next_back().copied().unwrap_or(0)
    }

    /// Every row, including flat ones, in id order.
    pub fn rows(&self) -> impl Iterator<Item = &LongPosition> {
        self.rows.values()
    }

    /// Rows with non-zero quantity, in id order.
    pub fn active(&self) -> impl Iterator<Item = &LongPosition> {
        self.rows.values().filter(|p| p.is_active())
    }

    /// Rows with positive quantity on `symbol`, oldest first by
    /// `(date_acquired, id)`.
    pub fn held_for_symbol(&self, symbol: &str) -> Vec<&LongPosition> {
        let mut out: Vec<&LongPosition> = self
            .rows
            .values()
            .filter(|p| p.symbol == symbol && p.quantity > 0)
            .collect();
        out.sort_by_key(|p| (p.date_acquired, p.id));
        out
    }

    /// Distinct symbols with non-zero holdings.
    pub fn active_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.active().map(|p| p.symbol.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Apply a fill to the keyed row, inserting it at `new_id` when absent.
    ///
    /// Buy: `qty += n`, cost becomes the weighted average with fees
    /// capitalised (zero if the row lands flat). Sell: `qty -= n`, cost
    /// unchanged. A Sell with no row opens at `-n` with cost = price.
    pub fn apply_fill(
        &mut self,
        owner_id: Uuid,
        key: &PositionKey,
        fill: &PositionFill,
        new_id: RowId,
    ) -> PositionChange {
        let multiplier = key.instrument_type.multiplier();

        if let Some(id) = self.index.get(key).copied() {
            if let Some(pos) = self.rows.get_mut(&id) {
                let before = pos.quantity;
                match fill.side {
                    Side::Buy => {
                        let after = before.saturating_add(fill.quantity);
                        pos.cost_basis = weighted_average(
                            &[(before, pos.cost_basis), (fill.quantity, fill.price)],
                            fill.fees,
                            after,
                            multiplier,
                        );
                        pos.quantity = after;
                    }
                    Side::Sell => {
                        pos.quantity = before.saturating_sub(fill.quantity);
                    }
                }
                return PositionChange {
                    position_id: id,
                    created: false,
                    quantity_before: before,
                    quantity_after: pos.quantity,
                };
            }
        }

        let (quantity, cost_basis) = match fill.side {
            Side::Buy => (
                fill.quantity,
                weighted_average(
                    &[(fill.quantity, fill.price)],
                    fill.fees,
                    fill.quantity,
                    multiplier,
                ),
            ),
            Side::Sell => (-fill.quantity, fill.price),
        };
        let row = LongPosition {
            id: new_id,
            owner_id,
            symbol: key.symbol.clone(),
            instrument_type: key.instrument_type,
            quantity,
            cost_basis,
            expiration: key.expiration,
            strike: key.strike,
            last_manual_price: None,
            date_acquired: fill.date,
        };
        self.index.insert(key.clone(), new_id);
        self.rows.insert(new_id, row);
        PositionChange {
            position_id: new_id,
            created: true,
            quantity_before: 0,
            quantity_after: quantity,
        }
    }

    /// Shift a row's quantity without touching cost (ledger reversal).
    pub fn adjust_quantity(&mut self, id: RowId, delta: i64) -> Result<i64, PositionError> {
        let pos = self
            .rows
            .get_mut(&id)
            .ok_or(PositionError::NotFound { id })?;
        pos.quantity = pos.quantity.saturating_add(delta);
        Ok(pos.quantity)
    }

    pub fn set_manual_price(&mut self, id: RowId, price: Micros) -> Result<(), PositionError> {
        if price.is_negative() {
            return Err(PositionError::NegativePrice { price });
        }
        let pos = self
            .rows
            .get_mut(&id)
            .ok_or(PositionError::NotFound { id })?;
        if pos.instrument_type == InstrumentType::Stock {
            return Err(PositionError::NotAnOption { id });
        }
        pos.last_manual_price = Some(price);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionType;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn fill(side: Side, quantity: i64, price: Micros, fees: Micros) -> PositionFill {
        PositionFill {
            side,
            quantity,
            price,
            fees,
            date: d(1),
        }
    }

    #[test]
    fn buys_merge_into_weighted_average() {
        let mut b = LongBook::new();
        let key = PositionKey::stock("AAPL");
        let c1 = b.apply_fill(Uuid::nil(), &key, &fill(Side::Buy, 10, Micros::dollars(100), Micros::ZERO), 1);
        assert!(c1.created);
        let c2 = b.apply_fill(Uuid::nil(), &key, &fill(Side::Buy, 10, Micros::dollars(200), Micros::ZERO), 2);
        assert!(!c2.created);
        assert_eq!(c2.position_id, 1);

        let pos = b.find(&key).unwrap();
        assert_eq!(pos.quantity, 20);
        assert_eq!(pos.cost_basis, Micros::dollars(150));
    }

    #[test]
    fn sell_keeps_cost_and_flat_rows_leave_active_view() {
        let mut b = LongBook::new();
        let key = PositionKey::stock("MSFT");
        b.apply_fill(Uuid::nil(), &key, &fill(Side::Buy, 5, Micros::dollars(40), Micros::dollars(5)), 1);
        assert_eq!(b.get(1).unwrap().cost_basis, Micros::dollars(41));

        let c = b.apply_fill(Uuid::nil(), &key, &fill(Side::Sell, 5, Micros::dollars(60), Micros::ZERO), 2);
        assert_eq!(c.quantity_after, 0);
        assert_eq!(b.get(1).unwrap().cost_basis, Micros::dollars(41));
        assert_eq!(b.active().count(), 0);
        assert_eq!(b.rows().count(), 1);
    }

    #[test]
    fn sell_without_row_opens_negative() {
        let mut b = LongBook::new();
        let key = PositionKey::stock("TSLA");
        let c = b.apply_fill(Uuid::nil(), &key, &fill(Side::Sell, 3, Micros::dollars(200), Micros::ZERO), 7);
        assert!(c.created);
        assert_eq!(c.quantity_after, -3);
        assert_eq!(b.get(7).unwrap().cost_basis, Micros::dollars(200));
    }

    #[test]
    fn option_keys_separate_strikes() {
        let mut b = LongBook::new();
        let exp = NaiveDate::from_ymd_opt(2026, 1, 16).unwrap();
        let k1 = PositionKey::option("SOFI", OptionType::Call, Micros::dollars(10), exp);
        let k2 = PositionKey::option("SOFI", OptionType::Call, Micros::dollars(12), exp);
        b.apply_fill(Uuid::nil(), &k1, &fill(Side::Buy, 1, Micros::dollars(3), Micros::ZERO), 1);
        b.apply_fill(Uuid::nil(), &k2, &fill(Side::Buy, 1, Micros::dollars(2), Micros::ZERO), 2);
        assert_eq!(b.active().count(), 2);
        assert_eq!(b.active_symbols(), vec!["SOFI".to_string()]);
    }

    #[test]
    fn manual_price_only_for_options() {
        let mut b = LongBook::new();
        b.apply_fill(Uuid::nil(), &PositionKey::stock("AAPL"), &fill(Side::Buy, 1, Micros::dollars(1), Micros::ZERO), 1);
        assert_eq!(
            b.set_manual_price(1, Micros::dollars(2)),
            Err(PositionError::NotAnOption { id: 1 })
        );
        assert_eq!(
            b.set_manual_price(9, Micros::dollars(2)),
            Err(PositionError::NotFound { id: 9 })
        );
    }

    #[test]
    fn from_rows_rejects_duplicate_keys() {
        let row = LongPosition {
            id: 1,
            owner_id: Uuid::nil(),
            symbol: "AAPL".into(),
            instrument_type: InstrumentType::Stock,
            quantity: 1,
            cost_basis: Micros::dollars(1),
            expiration: None,
            strike: None,
            last_manual_price: None,
            date_acquired: d(1),
        };
        let mut dup = row.clone();
        dup.id = 2;
        assert_eq!(
            LongBook::from_rows(vec![row, dup]).unwrap_err(),
            PositionError::DuplicateKey { first: 1, second: 2 }
        );
    }
}
