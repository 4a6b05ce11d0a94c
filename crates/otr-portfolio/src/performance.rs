//! Flow-adjusted period returns over equity snapshots.
//!
//! Snapshots are ordered by date and paired; each pair is one period:
//!
//! ```text
//! net_flow = Σ USD deposits + withdrawals dated in (prev.date, cur.date]
//! base     = prev.equity + net_flow
//! profit   = cur.equity - base
//! return   = profit / base          (0 when base == 0)
//! ```
//!
//! The first snapshot has an implicit zero base, so its return and profit
//! are 0. Horizon returns compound the selected periods: `Π(1 + r) - 1`.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::Serialize;

use crate::fixedpoint::Micros;
use crate::ledger::LedgerStore;
use crate::types::{Currency, PortfolioSnapshot};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeriodReturn {
    /// `None` for the first period.
    pub start: Option<NaiveDate>,
    pub end: NaiveDate,
    pub start_equity: Micros,
    pub end_equity: Micros,
    pub net_flow: Micros,
    pub base: Micros,
    pub profit: Micros,
    /// Fractional return, `0.05` is 5%.
    pub return_rate: f64,
    /// Ends at the live (unsaved) valuation.
    pub live: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HorizonReturn {
    pub return_rate: f64,
    pub profit: Micros,
    pub periods: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    WeekToDate,
    MonthToDate,
    YearToDate,
    Week52,
    Lifetime,
}

impl Horizon {
    /// First day covered by the horizon; `None` means all periods.
    pub fn start(self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            Horizon::WeekToDate => {
                today.checked_sub_days(Days::new(today.weekday().num_days_from_monday() as u64))
            }
            Horizon::MonthToDate => today.with_day(1),
            Horizon::YearToDate => NaiveDate::from_ymd_opt(today.year(), 1, 1),
            Horizon::Week52 => today.checked_sub_days(Days::new(364)),
            Horizon::Lifetime => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub as_of: NaiveDate,
    pub periods: Vec<PeriodReturn>,
    pub wtd: HorizonReturn,
    pub mtd: HorizonReturn,
    pub ytd: HorizonReturn,
    pub week52: HorizonReturn,
    pub lifetime: HorizonReturn,
    /// YTD return annualised over the days elapsed this year.
    pub fy_run_rate: f64,
    pub days_elapsed: i64,
}

/// Build per-period returns.
///
/// `live` is today's valuation: appended as a final period when dated after
/// the last snapshot, replacing it when on the same date, ignored when
/// older.
pub fn period_returns(
    snapshots: &[PortfolioSnapshot],
    ledger: &LedgerStore,
    live: Option<(NaiveDate, Micros)>,
) -> Vec<PeriodReturn> {
    let mut points: Vec<(NaiveDate, Micros, bool)> = snapshots
        .iter()
        .map(|s| (s.snapshot_date, s.total_equity, false))
        .collect();
    points.sort_by_key(|p| p.0);
    points.dedup_by_key(|p| p.0);

    if let Some((date, equity)) = live {
        match points.last_mut() {
            Some(last) if last.0 == date => *last = (date, equity, true),
            Some(last) if last.0 > date => {}
            _ => points.push((date, equity, true)),
        }
    }

    let mut out = Vec::with_capacity(points.len());
    let mut prev: Option<(NaiveDate, Micros)> = None;
    for (date, equity, is_live) in points {
        let period = match prev {
            None => PeriodReturn {
                start: None,
                end: date,
                start_equity: Micros::ZERO,
                end_equity: equity,
                net_flow: Micros::ZERO,
                base: Micros::ZERO,
                profit: Micros::ZERO,
                return_rate: 0.0,
                live: is_live,
            },
            Some((prev_date, prev_equity)) => {
                let net_flow = ledger.net_flow(Currency::Usd, Some(prev_date), date);
                let base = prev_equity.saturating_add(net_flow);
                let profit = equity.saturating_sub(base);
                PeriodReturn {
                    start: Some(prev_date),
                    end: date,
                    start_equity: prev_equity,
                    end_equity: equity,
                    net_flow,
                    base,
                    profit,
                    return_rate: profit.ratio(base),
                    live: is_live,
                }
            }
        };
        out.push(period);
        prev = Some((date, equity));
    }
    out
}

/// Compound a run of periods: `Π(1 + r) - 1`; profits add.
pub fn compound<'a>(periods: impl IntoIterator<Item = &'a PeriodReturn>) -> HorizonReturn {
    let mut growth = 1.0_f64;
    let mut profit = Micros::ZERO;
    let mut n = 0;
    for p in periods {
        growth *= 1.0 + p.return_rate;
        profit = profit.saturating_add(p.profit);
        n += 1;
    }
    HorizonReturn {
        return_rate: if n == 0 { 0.0 } else { growth - 1.0 },
        profit,
        periods: n,
    }
}

/// Compound the periods ending on or after the horizon start.
pub fn horizon_return(periods: &[PeriodReturn], horizon: Horizon, today: NaiveDate) -> HorizonReturn {
    let start = horizon.start(today);
    compound(
        periods
            .iter()
            .filter(|p| p.end <= today && start.map_or(true, |s| p.end >= s)),
    )
}

/// `(1 + ytd)^(365 / days) - 1`, with `days >= 1`. Zero when YTD is a total loss.
pub fn fy_run_rate(ytd: f64, days_elapsed: i64) -> f64 {
    if ytd <= -1.0 {
        return 0.0;
    }
    let days = days_elapsed.max(1) as f64;
    (1.0 + ytd).powf(365.0 / days) - 1.0
}

pub fn performance_report(
    snapshots: &[PortfolioSnapshot],
    ledger: &LedgerStore,
    live: Option<(NaiveDate, Micros)>,
    today: NaiveDate,
) -> PerformanceReport {
    let periods = period_returns(snapshots, ledger, live);
    let ytd = horizon_return(&periods, Horizon::YearToDate, today);
    let days_elapsed = today.ordinal() as i64;
    PerformanceReport {
        as_of: today,
        wtd: horizon_return(&periods, Horizon::WeekToDate, today),
        mtd: horizon_return(&periods, Horizon::MonthToDate, today),
        week52: horizon_return(&periods, Horizon::Week52, today),
        lifetime: horizon_return(&periods, Horizon::Lifetime, today),
        fy_run_rate: fy_run_rate(ytd.return_rate, days_elapsed),
        ytd,
        days_elapsed,
        periods,
    }
}

// ---------------------------------------------------------------------------
// Baseline and lifetime CAD
// ---------------------------------------------------------------------------

/// Previous year's Dec-31 snapshot, else the first snapshot of this year.
pub fn baseline_snapshot(snapshots: &[PortfolioSnapshot], today: NaiveDate) -> Option<&PortfolioSnapshot> {
    let dec31 = NaiveDate::from_ymd_opt(today.year() - 1, 12, 31)?;
    snapshots
        .iter()
        .find(|s| s.snapshot_date == dec31)
        .or_else(|| {
            snapshots
                .iter()
                .filter(|s| s.snapshot_date.year() == today.year() && s.snapshot_date <= today)
                .min_by_key(|s| s.snapshot_date)
        })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LifetimePl {
    pub net_invested_cad: Micros,
    pub value_cad: Micros,
    pub profit_cad: Micros,
    /// Zero when nothing is invested.
    pub return_rate: f64,
}

/// Lifetime P/L in CAD: `net_value_usd * fx - Σ CAD flows`.
pub fn lifetime_pl_cad(net_value_usd: Micros, fx_rate: f64, ledger: &LedgerStore) -> LifetimePl {
    let net_invested_cad = ledger.net_invested(Currency::Cad);
    let value_cad = net_value_usd.scale_f64(fx_rate);
    let profit_cad = value_cad.saturating_sub(net_invested_cad);
    LifetimePl {
        net_invested_cad,
        value_cad,
        profit_cad,
        return_rate: if net_invested_cad.is_positive() {
            profit_cad.ratio(net_invested_cad)
        } else {
            0.0
        },
    }
}

/// Fridays and Dec 31 make comparable snapshot series.
pub fn is_recommended_snapshot_date(date: NaiveDate) -> bool {
    date.weekday() == Weekday::Fri || (date.month() == 12 && date.day() == 31)
}
