//! Short option lots (written calls and puts).
//!
//! Lots are consumed FIFO by `(open_date, id)`. A lot fully consumed flips
//! to its terminal status in place. A partial consumption either decrements
//! the lot in place (buy-to-close) or splits it (expire / assign): the
//! original keeps the remainder and a new lot carries the consumed count
//! with the terminal status.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::fixedpoint::Micros;
use crate::types::{LotEffect, LotStatus, OptionType, RowId, ShortOptionLot};

/// How a partial consumption is recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Decrement the lot's contracts, no new row.
    InPlace,
    /// Decrement the lot and insert a terminal-status clone for the consumed part.
    Split,
}

/// One lot touched by a consumption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotConsumption {
    pub lot_id: RowId,
    pub contracts: i64,
    /// The lot itself flipped to the terminal status.
    pub whole: bool,
    /// Id of the inserted terminal lot when the lot was split.
    pub split_lot_id: Option<RowId>,
    pub linked_asset_id: Option<RowId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Consumption {
    pub requested: i64,
    pub filled: i64,
    pub lots: Vec<LotConsumption>,
}

impl Consumption {
    pub fn remaining(&self) -> i64 {
        self.requested - self.filled
    }

    /// Every row id written: consumed lots plus split lots.
    pub fn touched_ids(&self) -> Vec<RowId> {
        let mut out = Vec::new();
        for l in &self.lots {
            out.push(l.lot_id);
            if let Some(s) = l.split_lot_id {
                out.push(s);
            }
        }
        out
    }

    pub fn effects(&self) -> Vec<LotEffect> {
        self.lots
            .iter()
            .map(|l| LotEffect::Consumed {
                lot_id: l.lot_id,
                contracts: l.contracts,
                whole: l.whole,
                split_lot_id: l.split_lot_id,
            })
            .collect()
    }
}

/// Rows written while undoing a lot effect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Undone {
    pub upserted: Vec<RowId>,
    pub removed: Vec<RowId>,
}

/// Parameters for terminating lots.
#[derive(Clone, Debug)]
pub struct Termination {
    pub status: LotStatus,
    pub mode: ConsumeMode,
    pub closing_price: Option<Micros>,
    pub date: NaiveDate,
}

#[derive(Clone, Debug, Default)]
pub struct ShortBook {
    lots: BTreeMap<RowId, ShortOptionLot>,
}

impl ShortBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lots(lots: Vec<ShortOptionLot>) -> Self {
        Self {
            lots: lots.into_iter().map(|l| (l.id, l)).collect(),
        }
    }

    pub fn get(&self, id: RowId) -> Option<&ShortOptionLot> {
        self.lots.get(&id)
    }

    pub fn max_id(&self) -> RowId {
        self.lots.keys().next_back().copied().unwrap_or(0)
    }

    pub fn lots(&self) -> impl Iterator<Item = &ShortOptionLot> {
        self.lots.values()
    }

    /// OPEN lots ordered FIFO by `(open_date, id)`.
    pub fn open_lots(&self) -> Vec<&ShortOptionLot> {
        let mut out: Vec<&ShortOptionLot> = self.lots.values().filter(|l| l.is_open()).collect();
        out.sort_by_key(|l| (l.open_date, l.id));
        out
    }

    /// OPEN CALL lots on `symbol`, FIFO.
    pub fn open_calls(&self, symbol: &str) -> Vec<&ShortOptionLot> {
        self.open_lots()
            .into_iter()
            .filter(|l| l.symbol == symbol && l.option_type == OptionType::Call)
            .collect()
    }

    /// Ids of OPEN lots matching the contract terms, FIFO.
    pub fn open_matching(
        &self,
        symbol: &str,
        option_type: OptionType,
        strike: Micros,
        expiration: NaiveDate,
    ) -> Vec<RowId> {
        self.open_lots()
            .into_iter()
            .filter(|l| l.matches(symbol, option_type, strike, expiration))
            .map(|l| l.id)
            .collect()
    }

    pub(crate) fn insert(&mut self, lot: ShortOptionLot) {
        self.lots.insert(lot.id, lot);
    }

    /// Consume up to `contracts` from the given lots in order.
    ///
    /// Non-open or unknown ids are skipped. `alloc` supplies ids for split
    /// lots. The returned `filled` may be less than `requested`.
    pub(crate) fn consume(
        &mut self,
        ids: &[RowId],
        contracts: i64,
        term: &Termination,
        alloc: &mut dyn FnMut() -> RowId,
    ) -> Consumption {
        let mut out = Consumption {
            requested: contracts,
            ..Consumption::default()
        };
        let mut remaining = contracts;

        for id in ids {
            if remaining <= 0 {
                break;
            }
            let Some(lot) = self.lots.get_mut(id) else {
                continue;
            };
            if !lot.is_open() || lot.contracts <= 0 {
                continue;
            }

            let take = lot.contracts.min(remaining);
            let linked = lot.linked_asset_id;
            let whole = take == lot.contracts;
            let mut split_lot_id = None;

            if whole {
                lot.status = term.status;
                lot.closing_price = term.closing_price;
                lot.closed_date = Some(term.date);
            } else {
                lot.contracts -= take;
                if term.mode == ConsumeMode::Split {
                    let mut part = lot.clone();
                    part.id = alloc();
                    part.contracts = take;
                    part.status = term.status;
                    part.closing_price = term.closing_price;
                    part.closed_date = Some(term.date);
                    split_lot_id = Some(part.id);
                    self.lots.insert(part.id, part);
                }
            }

            out.lots.push(LotConsumption {
                lot_id: *id,
                contracts: take,
                whole,
                split_lot_id,
                linked_asset_id: linked,
            });
            out.filled += take;
            remaining -= take;
        }
        out
    }

    /// Reverse one recorded effect. `None` when a lot it names is gone.
    ///
    /// An opened lot is removed. A consumed lot gets its contracts back:
    /// a split part merges into its still-open origin or reopens on its own;
    /// a whole lot reopens; an in-place decrement is added back, or re-issued
    /// as a new open lot when the origin has since been terminated.
    pub(crate) fn undo(
        &mut self,
        effect: &LotEffect,
        alloc: &mut dyn FnMut() -> RowId,
    ) -> Option<Undone> {
        let mut out = Undone::default();
        match *effect {
            LotEffect::Opened { lot_id } => {
                self.lots.remove(&lot_id)?;
                out.removed.push(lot_id);
            }
            LotEffect::Consumed {
                lot_id,
                contracts,
                whole,
                split_lot_id,
            } => {
                let origin_open = self.lots.get(&lot_id).is_some_and(|l| l.is_open());
                match split_lot_id {
                    Some(split) if origin_open => {
                        self.lots.remove(&split)?;
                        let lot = self.lots.get_mut(&lot_id)?;
                        lot.contracts += contracts;
                        out.removed.push(split);
                        out.upserted.push(lot_id);
                    }
                    Some(split) => {
                        reopen(self.lots.get_mut(&split)?);
                        out.upserted.push(split);
                    }
                    None if whole || origin_open => {
                        let lot = self.lots.get_mut(&lot_id)?;
                        if whole && !lot.is_open() {
                            reopen(lot);
                        } else {
                            lot.contracts += contracts;
                        }
                        out.upserted.push(lot_id);
                    }
                    None => {
                        let mut part = self.lots.get(&lot_id)?.clone();
                        part.id = alloc();
                        part.contracts = contracts;
                        reopen(&mut part);
                        out.upserted.push(part.id);
                        self.lots.insert(part.id, part);
                    }
                }
            }
        }
        Some(out)
    }
}

fn reopen(lot: &mut ShortOptionLot) {
    lot.status = LotStatus::Open;
    lot.closing_price = None;
    lot.closed_date = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn lot(id: RowId, contracts: i64, open_day: u32) -> ShortOptionLot {
        ShortOptionLot {
            id,
            owner_id: Uuid::nil(),
            symbol: "AAPL".into(),
            option_type: OptionType::Call,
            strike: Micros::dollars(150),
            expiration: d(31),
            contracts,
            premium_received: Micros::dollars(2),
            open_date: d(open_day),
            status: LotStatus::Open,
            linked_asset_id: Some(9),
            group_id: None,
            closing_price: None,
            closed_date: None,
        }
    }

    fn close(day: u32) -> Termination {
        Termination {
            status: LotStatus::Closed,
            mode: ConsumeMode::InPlace,
            closing_price: Some(Micros::cents(50)),
            date: d(day),
        }
    }

    #[test]
    fn fifo_order_uses_open_date_then_id() {
        let b = ShortBook::from_lots(vec![lot(5, 1, 2), lot(3, 1, 2), lot(8, 1, 1)]);
        let ids = b.open_matching("AAPL", OptionType::Call, Micros::dollars(150), d(31));
        assert_eq!(ids, vec![8, 3, 5]);
    }

    #[test]
    fn in_place_close_does_not_split() {
        let mut b = ShortBook::from_lots(vec![lot(1, 2, 1), lot(2, 5, 2)]);
        let mut next = 10;
        let mut alloc = || {
            next += 1;
            next
        };
        let c = b.consume(&[1, 2], 3, &close(20), &mut alloc);
        assert_eq!(c.filled, 3);
        assert_eq!(b.get(1).unwrap().status, LotStatus::Closed);
        assert_eq!(b.get(1).unwrap().closing_price, Some(Micros::cents(50)));
        assert_eq!(b.get(2).unwrap().contracts, 4);
        assert_eq!(b.get(2).unwrap().status, LotStatus::Open);
        assert_eq!(b.lots().count(), 2);
    }

    #[test]
    fn split_inserts_terminal_clone() {
        let mut b = ShortBook::from_lots(vec![lot(1, 5, 1)]);
        let mut alloc = || 42;
        let term = Termination {
            status: LotStatus::Expired,
            mode: ConsumeMode::Split,
            closing_price: Some(Micros::ZERO),
            date: d(31),
        };
        let c = b.consume(&[1], 2, &term, &mut alloc);
        assert_eq!(c.lots[0].split_lot_id, Some(42));
        assert_eq!(c.touched_ids(), vec![1, 42]);
        assert_eq!(b.get(1).unwrap().contracts, 3);
        let part = b.get(42).unwrap();
        assert_eq!(part.contracts, 2);
        assert_eq!(part.status, LotStatus::Expired);
        assert_eq!(part.linked_asset_id, Some(9));
    }

    #[test]
    fn undo_merges_a_split_back_into_its_open_origin() {
        let mut b = ShortBook::from_lots(vec![lot(1, 5, 1)]);
        let mut alloc = || 42;
        let term = Termination {
            status: LotStatus::Assigned,
            mode: ConsumeMode::Split,
            closing_price: None,
            date: d(31),
        };
        let c = b.consume(&[1], 2, &term, &mut alloc);
        let undone = b.undo(&c.effects()[0], &mut alloc).unwrap();
        assert_eq!(undone.removed, vec![42]);
        assert!(b.get(42).is_none());
        assert_eq!(b.get(1).unwrap().contracts, 5);
    }

    #[test]
    fn undo_reopens_split_part_when_origin_closed_later() {
        let mut b = ShortBook::from_lots(vec![lot(1, 5, 1)]);
        let mut alloc = || 42;
        let term = Termination {
            status: LotStatus::Expired,
            mode: ConsumeMode::Split,
            closing_price: Some(Micros::ZERO),
            date: d(31),
        };
        let expired = b.consume(&[1], 2, &term, &mut alloc);
        b.consume(&[1], 3, &close(31), &mut alloc);

        b.undo(&expired.effects()[0], &mut alloc).unwrap();
        let part = b.get(42).unwrap();
        assert_eq!(part.status, LotStatus::Open);
        assert_eq!(part.contracts, 2);
        assert_eq!(part.closed_date, None);
        assert_eq!(b.get(1).unwrap().status, LotStatus::Closed);
        assert_eq!(b.get(1).unwrap().contracts, 3);
    }

    #[test]
    fn undo_of_in_place_close_reissues_when_origin_is_gone() {
        let mut b = ShortBook::from_lots(vec![lot(1, 5, 1)]);
        let mut next = 50;
        let mut alloc = || {
            next += 1;
            next
        };
        let first = b.consume(&[1], 2, &close(10), &mut alloc);
        b.consume(&[1], 3, &close(12), &mut alloc);

        let undone = b.undo(&first.effects()[0], &mut alloc).unwrap();
        assert_eq!(undone.upserted, vec![51]);
        assert_eq!(b.get(51).unwrap().contracts, 2);
        assert!(b.get(51).unwrap().is_open());
        assert_eq!(b.get(1).unwrap().status, LotStatus::Closed);
    }

    #[test]
    fn undo_reopens_a_wholly_closed_lot() {
        let mut b = ShortBook::from_lots(vec![lot(1, 2, 1)]);
        let mut alloc = || 99;
        let c = b.consume(&[1], 2, &close(5), &mut alloc);
        b.undo(&c.effects()[0], &mut alloc).unwrap();
        let l = b.get(1).unwrap();
        assert!(l.is_open());
        assert_eq!(l.contracts, 2);
        assert_eq!(l.closing_price, None);
    }

    #[test]
    fn shortfall_is_reported_not_fatal() {
        let mut b = ShortBook::from_lots(vec![lot(1, 1, 1)]);
        let mut alloc = || 99;
        let c = b.consume(&[1, 77], 4, &close(3), &mut alloc);
        assert_eq!(c.filled, 1);
        assert_eq!(c.remaining(), 3);
    }
}
