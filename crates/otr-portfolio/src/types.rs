use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fixedpoint::Micros;

/// Row identifier for ledger entries, long positions and short lots.
pub type RowId = i64;

/// Shares per option contract.
pub const OPTION_MULTIPLIER: i64 = 100;

/// BUY or SELL for trades.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "BTO" | "BTC" | "B" => Some(Side::Buy),
            "SELL" | "STO" | "STC" | "S" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Currency {
    Usd,
    Cad,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Cad => "CAD",
        }
    }

    pub fn parse(s: &str) -> Option<Currency> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            "CAD" => Some(Currency::Cad),
            _ => None,
        }
    }
}

/// Ledger entry category.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Deposit,
    Withdrawal,
    Dividend,
    Interest,
    TradeStock,
    TradeLeapCall,
    TradeLeapPut,
    OptionPremium,
    OptionExpire,
    Fees,
}

impl LedgerKind {
    pub const ALL: [LedgerKind; 10] = [
        LedgerKind::Deposit,
        LedgerKind::Withdrawal,
        LedgerKind::Dividend,
        LedgerKind::Interest,
        LedgerKind::TradeStock,
        LedgerKind::TradeLeapCall,
        LedgerKind::TradeLeapPut,
        LedgerKind::OptionPremium,
        LedgerKind::OptionExpire,
        LedgerKind::Fees,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerKind::Deposit => "DEPOSIT",
            LedgerKind::Withdrawal => "WITHDRAWAL",
            LedgerKind::Dividend => "DIVIDEND",
            LedgerKind::Interest => "INTEREST",
            LedgerKind::TradeStock => "TRADE_STOCK",
            LedgerKind::TradeLeapCall => "TRADE_LEAP_CALL",
            LedgerKind::TradeLeapPut => "TRADE_LEAP_PUT",
            LedgerKind::OptionPremium => "OPTION_PREMIUM",
            LedgerKind::OptionExpire => "OPTION_EXPIRE",
            LedgerKind::Fees => "FEES",
        }
    }

    pub fn parse(s: &str) -> Option<LedgerKind> {
        let upper = s.trim().to_ascii_uppercase();
        LedgerKind::ALL.into_iter().find(|k| k.as_str() == upper)
    }

    /// External flows: the entries that adjust the performance base.
    pub fn is_flow(self) -> bool {
        matches!(self, LedgerKind::Deposit | LedgerKind::Withdrawal)
    }

    /// Trade entries carry a side and move long-position quantity.
    pub fn is_position_trade(self) -> bool {
        matches!(
            self,
            LedgerKind::TradeStock | LedgerKind::TradeLeapCall | LedgerKind::TradeLeapPut
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionType::Call => "CALL",
            OptionType::Put => "PUT",
        }
    }

    pub fn parse(s: &str) -> Option<OptionType> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALL" | "C" => Some(OptionType::Call),
            "PUT" | "P" => Some(OptionType::Put),
            _ => None,
        }
    }
}

/// Long-side instrument category.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentType {
    Stock,
    LeapCall,
    LeapPut,
}

impl InstrumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentType::Stock => "STOCK",
            InstrumentType::LeapCall => "LEAP_CALL",
            InstrumentType::LeapPut => "LEAP_PUT",
        }
    }

    pub fn parse(s: &str) -> Option<InstrumentType> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STOCK" => Some(InstrumentType::Stock),
            "LEAP_CALL" => Some(InstrumentType::LeapCall),
            "LEAP_PUT" => Some(InstrumentType::LeapPut),
            _ => None,
        }
    }

    pub fn for_option(option_type: OptionType) -> InstrumentType {
        match option_type {
            OptionType::Call => InstrumentType::LeapCall,
            OptionType::Put => InstrumentType::LeapPut,
        }
    }

    pub fn is_option(self) -> bool {
        !matches!(self, InstrumentType::Stock)
    }

    /// Cash multiplier per unit of quantity.
    pub fn multiplier(self) -> i64 {
        if self.is_option() {
            OPTION_MULTIPLIER
        } else {
            1
        }
    }

    pub fn ledger_kind(self) -> LedgerKind {
        match self {
            InstrumentType::Stock => LedgerKind::TradeStock,
            InstrumentType::LeapCall => LedgerKind::TradeLeapCall,
            InstrumentType::LeapPut => LedgerKind::TradeLeapPut,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Open,
    Closed,
    Expired,
    Assigned,
}

impl LotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LotStatus::Open => "OPEN",
            LotStatus::Closed => "CLOSED",
            LotStatus::Expired => "EXPIRED",
            LotStatus::Assigned => "ASSIGNED",
        }
    }

    pub fn parse(s: &str) -> Option<LotStatus> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(LotStatus::Open),
            "CLOSED" => Some(LotStatus::Closed),
            "EXPIRED" => Some(LotStatus::Expired),
            "ASSIGNED" => Some(LotStatus::Assigned),
            _ => None,
        }
    }
}

/// What an entry did to one short lot; deletion undoes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum LotEffect {
    /// The entry opened this lot.
    Opened { lot_id: RowId },
    /// The entry consumed `contracts` from this lot. `whole` when the lot
    /// flipped to a terminal status; `split_lot_id` when the consumed part
    /// was split off into its own row.
    Consumed {
        lot_id: RowId,
        contracts: i64,
        whole: bool,
        split_lot_id: Option<RowId>,
    },
}

/// One signed cash movement.
///
/// `side`, `quantity`, `fees` and `position_id` are only set on trade entries;
/// deletion uses them to reverse the quantity effect on the long position.
/// `lot_effects` does the same for short lots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: RowId,
    pub owner_id: Uuid,
    pub date: NaiveDate,
    pub amount: Micros,
    pub currency: Currency,
    pub kind: LedgerKind,
    pub related_symbol: Option<String>,
    pub description: String,
    pub group_id: Option<Uuid>,
    pub side: Option<Side>,
    pub quantity: Option<i64>,
    pub fees: Micros,
    pub position_id: Option<RowId>,
    #[serde(default)]
    pub lot_effects: Vec<LotEffect>,
}

/// Identity of a long holding. Strike and expiration are `None` for stock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub symbol: String,
    pub instrument_type: InstrumentType,
    pub strike: Option<Micros>,
    pub expiration: Option<NaiveDate>,
}

impl PositionKey {
    pub fn stock(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            instrument_type: InstrumentType::Stock,
            strike: None,
            expiration: None,
        }
    }

    pub fn option(
        symbol: impl Into<String>,
        option_type: OptionType,
        strike: Micros,
        expiration: NaiveDate,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            instrument_type: InstrumentType::for_option(option_type),
            strike: Some(strike),
            expiration: Some(expiration),
        }
    }
}

/// Stock shares or long option contracts with a weighted-average cost.
///
/// `cost_basis` is per share for stock and per contract-share (premium
/// quote, not ×100) for options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongPosition {
    pub id: RowId,
    pub owner_id: Uuid,
    pub symbol: String,
    pub instrument_type: InstrumentType,
    pub quantity: i64,
    pub cost_basis: Micros,
    pub expiration: Option<NaiveDate>,
    pub strike: Option<Micros>,
    pub last_manual_price: Option<Micros>,
    pub date_acquired: NaiveDate,
}

impl LongPosition {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            symbol: self.symbol.clone(),
            instrument_type: self.instrument_type,
            strike: self.strike,
            expiration: self.expiration,
        }
    }

    pub fn is_active(&self) -> bool {
        self.quantity != 0
    }
}

/// One short option liability lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortOptionLot {
    pub id: RowId,
    pub owner_id: Uuid,
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: Micros,
    pub expiration: NaiveDate,
    pub contracts: i64,
    pub premium_received: Micros,
    pub open_date: NaiveDate,
    pub status: LotStatus,
    pub linked_asset_id: Option<RowId>,
    pub group_id: Option<Uuid>,
    pub closing_price: Option<Micros>,
    pub closed_date: Option<NaiveDate>,
}

impl ShortOptionLot {
    pub fn is_open(&self) -> bool {
        self.status == LotStatus::Open
    }

    pub fn matches(
        &self,
        symbol: &str,
        option_type: OptionType,
        strike: Micros,
        expiration: NaiveDate,
    ) -> bool {
        self.symbol == symbol
            && self.option_type == option_type
            && self.strike == strike
            && self.expiration == expiration
    }
}

/// Recorded total equity (USD) plus the FX rate on that date.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub id: RowId,
    pub owner_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub total_equity: Micros,
    pub exchange_rate: f64,
}
