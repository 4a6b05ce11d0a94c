//! otr-portfolio
//!
//! Options portfolio core:
//! - Signed cash ledger (source of truth for cash)
//! - Long positions with weighted-average cost (stock and LEAP options)
//! - Short option lots with FIFO close / expire / assign / roll
//! - Collateral resolution for covered calls
//! - Net liquidation value, ITM call liability, flow-adjusted returns
//! - Pure deterministic logic (no IO, no clock, no price feed)
//!
//! Writes go through [`engine`] against a [`PortfolioBook`]; the rows they
//! touch come back out as a [`Journal`] for persistence.

pub mod access;
pub mod batch;
pub mod book;
pub mod collateral;
pub mod engine;
pub mod fixedpoint;
pub mod ledger;
pub mod performance;
pub mod positions;
pub mod shorts;
pub mod types;
pub mod valuation;

pub use access::{AccessContext, AccessRole};
pub use batch::{apply_batch, order_events, BatchRowError, BatchSummary, BatchWarning};
pub use book::{BookError, Journal, PortfolioBook};
pub use collateral::{
    available_collateral, locked_collateral, validate_collateral, CollateralError,
    CollateralKind, CollateralSlot,
};
pub use engine::{
    apply_event, assign, assign_contracts, delete_ledger_entry, expire, record_cash,
    record_long_option_trade, record_short_option_trade, record_stock_trade, roll,
    set_manual_price, Assignment, BulkAssignment, CashKind, CashMovement, EngineError,
    Expiration, FillOutcome, LongOptionTrade, OptionTerms, Roll, ShortOptionTrade, StockTrade,
    TradeEvent, TradeReport,
};
pub use fixedpoint::{Micros, ParseMicrosError, MICROS_SCALE};
pub use ledger::{LedgerError, LedgerStore};
pub use performance::{
    baseline_snapshot, fy_run_rate, is_recommended_snapshot_date, lifetime_pl_cad,
    performance_report, period_returns, Horizon, HorizonReturn, LifetimePl, PerformanceReport,
    PeriodReturn,
};
pub use positions::{LongBook, PositionError};
pub use shorts::ShortBook;
pub use types::{
    Currency, InstrumentType, LedgerEntry, LedgerKind, LongPosition, LotEffect, LotStatus,
    OptionType, PortfolioSnapshot, PositionKey, RowId, ShortOptionLot, Side, OPTION_MULTIPLIER,
};
pub use valuation::{
    compute_net_liquidation_value, itm_call_liability, mark_or_manual, marks,
    short_exposure_groups, value_positions, MarkMap, NetLiquidation, PositionValuation,
    ShortGroup,
};
