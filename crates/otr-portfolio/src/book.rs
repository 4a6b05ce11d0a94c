//! One owner's in-memory portfolio plus the journal of rows it changed.
//!
//! The engine mutates a [`PortfolioBook`]; every row it touches is recorded
//! and handed out as a [`Journal`] by [`PortfolioBook::take_journal`].
//! Persistence writes a journal inside a single database transaction, so a
//! compound operation (assignment, roll, cash with CAD basis) lands whole
//! or not at all.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::ledger::{LedgerError, LedgerStore};
use crate::positions::{LongBook, PositionError};
use crate::shorts::{ShortBook, Undone};
use crate::types::{LedgerEntry, LongPosition, LotEffect, RowId, ShortOptionLot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// A persisted row belongs to a different owner.
    OwnerMismatch { expected: Uuid, found: Uuid },
    Ledger(LedgerError),
    Position(PositionError),
}

impl std::fmt::Display for BookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OwnerMismatch { expected, found } => {
                write!(f, "row owned by {found} loaded into book of {expected}")
            }
            Self::Ledger(e) => write!(f, "{e}"),
            Self::Position(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BookError {}

impl From<LedgerError> for BookError {
    fn from(e: LedgerError) -> Self {
        BookError::Ledger(e)
    }
}

impl From<PositionError> for BookError {
    fn from(e: PositionError) -> Self {
        BookError::Position(e)
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Final state of every row written since the last `take_journal`.
///
/// Apply order for persistence: ledger deletes, long upserts, short deletes,
/// short upserts, ledger inserts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Journal {
    pub owner_id: Uuid,
    pub ledger_inserts: Vec<LedgerEntry>,
    pub ledger_deletes: Vec<RowId>,
    pub long_upserts: Vec<LongPosition>,
    pub short_upserts: Vec<ShortOptionLot>,
    pub short_deletes: Vec<RowId>,
}

impl Journal {
    pub fn is_empty(&self) -> bool {
        self.ledger_inserts.is_empty()
            && self.ledger_deletes.is_empty()
            && self.long_upserts.is_empty()
            && self.short_upserts.is_empty()
            && self.short_deletes.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.ledger_inserts.len()
            + self.ledger_deletes.len()
            + self.long_upserts.len()
            + self.short_upserts.len()
            + self.short_deletes.len()
    }
}

#[derive(Clone, Debug, Default)]
struct Pending {
    ledger_inserts: Vec<RowId>,
    ledger_deletes: Vec<RowId>,
    longs: BTreeSet<RowId>,
    shorts: BTreeSet<RowId>,
    short_deletes: BTreeSet<RowId>,
}

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PortfolioBook {
    owner_id: Uuid,
    ledger: LedgerStore,
    longs: LongBook,
    shorts: ShortBook,
    next_ledger_id: RowId,
    next_long_id: RowId,
    next_short_id: RowId,
    pending: Pending,
}

impl PortfolioBook {
    pub fn new(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            ledger: LedgerStore::new(),
            longs: LongBook::new(),
            shorts: ShortBook::new(),
            next_ledger_id: 1,
            next_long_id: 1,
            next_short_id: 1,
            pending: Pending::default(),
        }
    }

    /// Rebuild a book from persisted rows.
    pub fn from_parts(
        owner_id: Uuid,
        entries: Vec<LedgerEntry>,
        positions: Vec<LongPosition>,
        lots: Vec<ShortOptionLot>,
    ) -> Result<Self, BookError> {
        let foreign = entries
            .iter()
            .map(|e| e.owner_id)
            .chain(positions.iter().map(|p| p.owner_id))
            .chain(lots.iter().map(|l| l.owner_id))
            .find(|o| *o != owner_id);
        if let Some(found) = foreign {
            return Err(BookError::OwnerMismatch {
                expected: owner_id,
                found,
            });
        }

        let ledger = LedgerStore::from_entries(entries)?;
        let longs = LongBook::from_rows(positions)?;
        let shorts = ShortBook::from_lots(lots);
        Ok(Self {
            owner_id,
            next_ledger_id: ledger.max_id() + 1,
            next_long_id: longs.max_id() + 1,
            next_short_id: shorts.max_id() + 1,
            ledger,
            longs,
            shorts,
            pending: Pending::default(),
        })
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn longs(&self) -> &LongBook {
        &self.longs
    }

    pub fn shorts(&self) -> &ShortBook {
        &self.shorts
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.ledger_inserts.is_empty()
            || !self.pending.ledger_deletes.is_empty()
            || !self.pending.longs.is_empty()
            || !self.pending.shorts.is_empty()
            || !self.pending.short_deletes.is_empty()
    }

    /// Drain the changes made since the last call.
    pub fn take_journal(&mut self) -> Journal {
        let pending = std::mem::take(&mut self.pending);
        Journal {
            owner_id: self.owner_id,
            ledger_inserts: pending
                .ledger_inserts
                .iter()
                .filter_map(|id| self.ledger.get(*id).cloned())
                .collect(),
            ledger_deletes: pending.ledger_deletes,
            long_upserts: pending
                .longs
                .iter()
                .filter_map(|id| self.longs.get(*id).cloned())
                .collect(),
            short_upserts: pending
                .shorts
                .iter()
                .filter_map(|id| self.shorts.get(*id).cloned())
                .collect(),
            short_deletes: pending.short_deletes.into_iter().collect(),
        }
    }

    /// Drop pending changes without producing a journal (after a failed commit
    /// the caller reloads the book instead).
    pub fn discard_journal(&mut self) {
        self.pending = Pending::default();
    }

    // -----------------------------------------------------------------------
    // Engine-side mutation helpers
    // -----------------------------------------------------------------------

    /// Run `f` as one unit: on error the book is restored to its prior state.
    pub(crate) fn transact<T, E>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        let saved = self.clone();
        match f(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                *self = saved;
                Err(e)
            }
        }
    }

    pub(crate) fn alloc_ledger_id(&mut self) -> RowId {
        let id = self.next_ledger_id;
        self.next_ledger_id += 1;
        id
    }

    pub(crate) fn alloc_long_id(&mut self) -> RowId {
        let id = self.next_long_id;
        self.next_long_id += 1;
        id
    }

    pub(crate) fn alloc_short_id(&mut self) -> RowId {
        let id = self.next_short_id;
        self.next_short_id += 1;
        id
    }

    pub(crate) fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let id = entry.id;
        self.ledger.append(entry)?;
        self.pending.ledger_inserts.push(id);
        Ok(())
    }

    pub(crate) fn remove_entry(&mut self, id: RowId) -> Option<LedgerEntry> {
        let removed = self.ledger.remove(id)?;
        if let Some(idx) = self.pending.ledger_inserts.iter().position(|p| *p == id) {
            self.pending.ledger_inserts.remove(idx);
        } else {
            self.pending.ledger_deletes.push(id);
        }
        Some(removed)
    }

    pub(crate) fn longs_mut(&mut self) -> &mut LongBook {
        &mut self.longs
    }

    pub(crate) fn touch_long(&mut self, id: RowId) {
        self.pending.longs.insert(id);
    }

    pub(crate) fn insert_lot(&mut self, lot: ShortOptionLot) {
        self.pending.shorts.insert(lot.id);
        self.shorts.insert(lot);
    }

    /// Consume short lots, recording every touched row.
    pub(crate) fn consume_lots(
        &mut self,
        ids: &[RowId],
        contracts: i64,
        term: &crate::shorts::Termination,
    ) -> crate::shorts::Consumption {
        let mut next = self.next_short_id;
        let consumption = {
            let mut alloc = || {
                let id = next;
                next += 1;
                id
            };
            self.shorts.consume(ids, contracts, term, &mut alloc)
        };
        self.next_short_id = next;
        for id in consumption.touched_ids() {
            self.pending.shorts.insert(id);
        }
        consumption
    }

    /// Reverse what a ledger entry did to a short lot. `None` when a lot the
    /// effect names no longer exists; the book is then left unchanged.
    pub(crate) fn undo_lot_effect(&mut self, effect: &LotEffect) -> Option<Undone> {
        let mut next = self.next_short_id;
        let undone = {
            let mut alloc = || {
                let id = next;
                next += 1;
                id
            };
            self.shorts.undo(effect, &mut alloc)?
        };
        self.next_short_id = next;
        for id in &undone.removed {
            self.pending.shorts.remove(id);
            self.pending.short_deletes.insert(*id);
        }
        for id in &undone.upserted {
            self.pending.shorts.insert(*id);
        }
        Some(undone)
    }
}
