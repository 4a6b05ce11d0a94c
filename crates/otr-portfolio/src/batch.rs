//! Batch application of imported events.
//!
//! Events are applied in strict `(date, source row)` order. A failing row is
//! recorded and skipped; the book is unchanged by it and the batch goes on.

use serde::Serialize;

use crate::access::AccessContext;
use crate::book::PortfolioBook;
use crate::engine::{apply_event, EngineError, FillOutcome, TradeEvent, TradeReport};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchRowError {
    /// 1-based row number in the source file.
    pub row: usize,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchWarning {
    pub row: usize,
    pub outcome: FillOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub applied: usize,
    pub entries_written: usize,
    pub warnings: Vec<BatchWarning>,
    pub errors: Vec<BatchRowError>,
}

impl BatchSummary {
    pub fn record(&mut self, row: usize, result: Result<TradeReport, EngineError>) {
        match result {
            Ok(report) => {
                self.applied += 1;
                self.entries_written += report.entries.len();
                if !report.fill.is_ok() {
                    self.warnings.push(BatchWarning {
                        row,
                        outcome: report.fill,
                    });
                }
            }
            Err(e) => self.fail(row, e.to_string()),
        }
    }

    pub fn fail(&mut self, row: usize, message: impl Into<String>) {
        self.errors.push(BatchRowError {
            row,
            message: message.into(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Stable sort by `(date, row)`.
pub fn order_events(mut events: Vec<(usize, TradeEvent)>) -> Vec<(usize, TradeEvent)> {
    events.sort_by_key(|(row, ev)| (ev.date(), *row));
    events
}

/// Apply every event to the book, collecting per-row errors.
pub fn apply_batch(
    ctx: &AccessContext,
    book: &mut PortfolioBook,
    events: Vec<(usize, TradeEvent)>,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for (row, event) in order_events(events) {
        summary.record(row, apply_event(ctx, book, &event));
    }
    summary
}
