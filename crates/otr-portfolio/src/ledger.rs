//! Cash ledger store.
//!
//! The ledger is the source of truth for cash: every trade, premium, fee and
//! external flow lands here as one signed [`LedgerEntry`]. This module owns
//! the invariant-checking boundary for entries:
//!
//! - Trade entries carry a side; `amount + fees` (the gross) is `<= 0` for a
//!   Buy and `>= 0` for a Sell.
//! - `OPTION_EXPIRE` entries are always zero.
//! - `FEES` are never positive; `DEPOSIT` is positive and `WITHDRAWAL` negative.
//! - Descriptions are non-empty; ids are unique.
//!
//! Entries are immutable once appended. Removal exists only for the
//! delete-with-reversal path in the engine.
//!
//! `LedgerStore` is deterministic and pure: no IO, no time, no randomness.

use chrono::NaiveDate;
use uuid::Uuid;

use crate::fixedpoint::Micros;
use crate::types::{Currency, LedgerEntry, LedgerKind, RowId, Side};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All invariant violations that `LedgerStore` can surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Entry description must be non-empty.
    EmptyDescription,
    /// A row with the same id already exists.
    DuplicateId { id: RowId },
    /// `OPTION_EXPIRE` rows must carry a zero amount.
    NonZeroExpire { amount: Micros },
    /// Amount sign contradicts the entry kind or side.
    WrongSign {
        kind: LedgerKind,
        side: Option<Side>,
        amount: Micros,
    },
    /// Fees recorded on an entry must be non-negative.
    NegativeFees { fees: Micros },
    /// Position trade entries must record the side.
    MissingSide { kind: LedgerKind },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDescription => write!(f, "ledger invariant: description must not be empty"),
            Self::DuplicateId { id } => write!(f, "ledger invariant: duplicate entry id {id}"),
            Self::NonZeroExpire { amount } => write!(
                f,
                "ledger invariant: OPTION_EXPIRE amount must be 0, got {amount}"
            ),
            Self::WrongSign { kind, side, amount } => match side {
                Some(side) => write!(
                    f,
                    "ledger invariant: {} {} amount has wrong sign: {amount}",
                    side.as_str(),
                    kind.as_str()
                ),
                None => write!(
                    f,
                    "ledger invariant: {} amount has wrong sign: {amount}",
                    kind.as_str()
                ),
            },
            Self::NegativeFees { fees } => {
                write!(f, "ledger invariant: fees must be >= 0, got {fees}")
            }
            Self::MissingSide { kind } => {
                write!(f, "ledger invariant: {} entry must record a side", kind.as_str())
            }
        }
    }
}

impl std::error::Error for LedgerError {}

/// Check one entry against the ledger invariants (ids excluded).
pub fn validate_entry(entry: &LedgerEntry) -> Result<(), LedgerError> {
    if entry.description.trim().is_empty() {
        return Err(LedgerError::EmptyDescription);
    }
    if entry.fees.is_negative() {
        return Err(LedgerError::NegativeFees { fees: entry.fees });
    }

    let wrong_sign = || LedgerError::WrongSign {
        kind: entry.kind,
        side: entry.side,
        amount: entry.amount,
    };

    match entry.kind {
        LedgerKind::OptionExpire => {
            if !entry.amount.is_zero() {
                return Err(LedgerError::NonZeroExpire {
                    amount: entry.amount,
                });
            }
        }
        LedgerKind::Fees => {
            if entry.amount.is_positive() {
                return Err(wrong_sign());
            }
        }
        LedgerKind::Deposit => {
            if !entry.amount.is_positive() {
                return Err(wrong_sign());
            }
        }
        LedgerKind::Withdrawal => {
            if !entry.amount.is_negative() {
                return Err(wrong_sign());
            }
        }
        LedgerKind::Dividend => {
            if entry.amount.is_negative() {
                return Err(wrong_sign());
            }
        }
        LedgerKind::Interest => {}
        LedgerKind::TradeStock
        | LedgerKind::TradeLeapCall
        | LedgerKind::TradeLeapPut
        | LedgerKind::OptionPremium => {
            let side = match entry.side {
                Some(s) => s,
                None if entry.kind == LedgerKind::OptionPremium => return Ok(()),
                None => return Err(LedgerError::MissingSide { kind: entry.kind }),
            };
            let gross = entry.amount.saturating_add(entry.fees);
            let ok = match side {
                Side::Buy => !gross.is_positive(),
                Side::Sell => !gross.is_negative(),
            };
            if !ok {
                return Err(wrong_sign());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Append-only cash ledger for one owner.
#[derive(Clone, Debug, Default)]
pub struct LedgerStore {
    entries: Vec<LedgerEntry>,
}

/// One row of the running-balance view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceRow<'a> {
    pub entry: &'a LedgerEntry,
    pub balance: Micros,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted rows, validating every entry.
    pub fn from_entries(mut entries: Vec<LedgerEntry>) -> Result<Self, LedgerError> {
        entries.sort_by_key(|e| e.id);
        for pair in entries.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(LedgerError::DuplicateId { id: pair[1].id });
            }
        }
        for e in &entries {
            validate_entry(e)?;
        }
        Ok(Self { entries })
    }

    // -----------------------------------------------------------------------
    // Write surface
    // -----------------------------------------------------------------------

    /// Append one entry, enforcing all invariants.
    ///
    /// The store is **not** mutated on error.
    pub fn append(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        validate_entry(&entry)?;
        if self.get(entry.id).is_some() {
            return Err(LedgerError::DuplicateId { id: entry.id });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: RowId) -> Option<LedgerEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub fn get(&self, id: RowId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// All entries in insertion (id) order.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_id(&self) -> RowId {
        self.entries.iter().map(|e| e.id).max().unwrap_or(0)
    }

    /// Entries sharing a group id, in insertion order.
    pub fn group(&self, group_id: Uuid) -> Vec<&LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.group_id == Some(group_id))
            .collect()
    }

    /// Entries sorted by `(date, id)`, newest last.
    pub fn chronological(&self) -> Vec<&LedgerEntry> {
        let mut out: Vec<&LedgerEntry> = self.entries.iter().collect();
        out.sort_by_key(|e| (e.date, e.id));
        out
    }

    /// Cash balance in one currency: the sum of all its entries.
    pub fn cash_balance(&self, currency: Currency) -> Micros {
        self.entries
            .iter()
            .filter(|e| e.currency == currency)
            .map(|e| e.amount)
            .sum()
    }

    /// Net external flows (deposits + withdrawals) dated in `(after, upto]`.
    ///
    /// `after = None` means "from the beginning".
    pub fn net_flow(&self, currency: Currency, after: Option<NaiveDate>, upto: NaiveDate) -> Micros {
        self.entries
            .iter()
            .filter(|e| e.currency == currency && e.kind.is_flow())
            .filter(|e| e.date <= upto && after.map_or(true, |a| e.date > a))
            .map(|e| e.amount)
            .sum()
    }

    /// Lifetime net external flows in one currency.
    pub fn net_invested(&self, currency: Currency) -> Micros {
        self.entries
            .iter()
            .filter(|e| e.currency == currency && e.kind.is_flow())
            .map(|e| e.amount)
            .sum()
    }

    /// Chronological running balance in one currency.
    pub fn running_balance(&self, currency: Currency) -> Vec<BalanceRow<'_>> {
        let mut balance = Micros::ZERO;
        self.chronological()
            .into_iter()
            .filter(|e| e.currency == currency)
            .map(|entry| {
                balance = balance.saturating_add(entry.amount);
                BalanceRow { entry, balance }
            })
            .collect()
    }

    /// Re-check every stored entry. For tests and startup verification.
    pub fn verify_integrity(&self) -> bool {
        let mut ids: Vec<RowId> = self.entries.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len() == self.entries.len() && self.entries.iter().all(|e| validate_entry(e).is_ok())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn entry(id: RowId, date: NaiveDate, kind: LedgerKind, amount: Micros) -> LedgerEntry {
        LedgerEntry {
            id,
            owner_id: Uuid::nil(),
            date,
            amount,
            currency: Currency::Usd,
            kind,
            related_symbol: None,
            description: format!("{} {}", kind.as_str(), amount),
            group_id: None,
            side: None,
            quantity: None,
            fees: Micros::ZERO,
            position_id: None,
            lot_effects: Vec::new(),
        }
    }

    #[test]
    fn append_rejects_nonzero_expire() {
        let mut l = LedgerStore::new();
        let err = l
            .append(entry(1, d(2024, 1, 5), LedgerKind::OptionExpire, Micros::dollars(1)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::NonZeroExpire { .. }));
        assert!(l.is_empty());
    }

    #[test]
    fn trade_sign_follows_side_including_fees() {
        let mut buy = entry(1, d(2024, 1, 5), LedgerKind::TradeStock, Micros::dollars(-1001));
        buy.side = Some(Side::Buy);
        buy.fees = Micros::dollars(1);
        assert!(validate_entry(&buy).is_ok());

        buy.amount = Micros::dollars(10);
        assert!(matches!(
            validate_entry(&buy),
            Err(LedgerError::WrongSign { .. })
        ));

        // Selling a worthless contract nets out to minus the fees.
        let mut sell = entry(2, d(2024, 1, 5), LedgerKind::OptionPremium, Micros::dollars(-1));
        sell.side = Some(Side::Sell);
        sell.fees = Micros::dollars(1);
        assert!(validate_entry(&sell).is_ok());
    }

    #[test]
    fn stock_trade_without_side_is_rejected() {
        let e = entry(1, d(2024, 1, 5), LedgerKind::TradeStock, Micros::dollars(-5));
        assert_eq!(
            validate_entry(&e),
            Err(LedgerError::MissingSide {
                kind: LedgerKind::TradeStock
            })
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut l = LedgerStore::new();
        l.append(entry(1, d(2024, 1, 5), LedgerKind::Deposit, Micros::dollars(10)))
            .unwrap();
        let err = l
            .append(entry(1, d(2024, 1, 6), LedgerKind::Deposit, Micros::dollars(10)))
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicateId { id: 1 });
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn net_flow_is_half_open_on_the_left() {
        let mut l = LedgerStore::new();
        l.append(entry(1, d(2024, 1, 5), LedgerKind::Deposit, Micros::dollars(100)))
            .unwrap();
        l.append(entry(2, d(2024, 1, 12), LedgerKind::Deposit, Micros::dollars(50)))
            .unwrap();
        l.append(entry(3, d(2024, 1, 12), LedgerKind::Dividend, Micros::dollars(7)))
            .unwrap();
        l.append(entry(4, d(2024, 1, 19), LedgerKind::Withdrawal, Micros::dollars(-20)))
            .unwrap();

        assert_eq!(
            l.net_flow(Currency::Usd, Some(d(2024, 1, 5)), d(2024, 1, 12)),
            Micros::dollars(50)
        );
        assert_eq!(
            l.net_flow(Currency::Usd, None, d(2024, 1, 19)),
            Micros::dollars(130)
        );
        assert_eq!(l.net_invested(Currency::Usd), Micros::dollars(130));
        assert_eq!(l.cash_balance(Currency::Usd), Micros::dollars(137));
        assert_eq!(l.net_invested(Currency::Cad), Micros::ZERO);
    }

    #[test]
    fn running_balance_is_chronological() {
        let mut l = LedgerStore::new();
        l.append(entry(1, d(2024, 2, 1), LedgerKind::Withdrawal, Micros::dollars(-30)))
            .unwrap();
        l.append(entry(2, d(2024, 1, 1), LedgerKind::Deposit, Micros::dollars(100)))
            .unwrap();

        let rows = l.running_balance(Currency::Usd);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entry.id, 2);
        assert_eq!(rows[0].balance, Micros::dollars(100));
        assert_eq!(rows[1].balance, Micros::dollars(70));
        assert!(l.verify_integrity());
    }

    #[test]
    fn from_entries_detects_duplicates() {
        let a = entry(3, d(2024, 1, 1), LedgerKind::Deposit, Micros::dollars(1));
        let b = a.clone();
        assert_eq!(
            LedgerStore::from_entries(vec![a, b]).unwrap_err(),
            LedgerError::DuplicateId { id: 3 }
        );
    }
}
