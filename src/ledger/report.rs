use crate::core::currency::CurrencyCode;
use crate::core::exchange::ExchangeId;
use crate::ledger::disposal::{DisposalEvent, DisposalKind};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One line of a gains report, possibly summarizing several disposals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub kind: DisposalKind,
    pub exchange: ExchangeId,
    pub currency: CurrencyCode,
    pub disposed_on: NaiveDate,
    /// Acquisition date of the oldest lot in the row.
    pub acquired_on: NaiveDate,
    pub amount: Decimal,
    pub cost: Decimal,
    pub proceeds: Decimal,
    pub gain: Decimal,
    pub long_term: bool,
}

impl ReportRow {
    fn from_event(event: &DisposalEvent) -> Self {
        Self {
            kind: event.kind,
            exchange: event.exchange.clone(),
            currency: event.currency.clone(),
            disposed_on: event.disposed_at.date_naive(),
            acquired_on: event.acquired_at.date_naive(),
            amount: event.amount,
            cost: event.cost,
            proceeds: event.proceeds,
            gain: event.gain,
            long_term: event.long_term,
        }
    }

    fn absorb(&mut self, other: &ReportRow) {
        self.acquired_on = self.acquired_on.min(other.acquired_on);
        self.amount += other.amount;
        self.cost += other.cost;
        self.proceeds += other.proceeds;
        self.gain += other.gain;
    }
}

/// Realized gains over a set of disposals, in the home currency.
///
/// # Examples
///
/// ```
/// use ccgains::ledger::report::GainsReport;
///
/// let report = GainsReport::new(Vec::new(), "EUR");
/// assert!(report.is_empty());
/// assert_eq!(report.total_gain(), rust_decimal::Decimal::ZERO);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GainsReport {
    home_currency: CurrencyCode,
    year: Option<i32>,
    events: Vec<DisposalEvent>,
}

impl GainsReport {
    pub fn new(events: Vec<DisposalEvent>, home_currency: impl Into<CurrencyCode>) -> Self {
        Self {
            home_currency: home_currency.into(),
            year: None,
            events,
        }
    }

    /// Only disposals made in calendar year `year` (UTC).
    pub fn for_year(
        events: &[DisposalEvent],
        year: i32,
        home_currency: impl Into<CurrencyCode>,
    ) -> Self {
        Self {
            home_currency: home_currency.into(),
            year: Some(year),
            events: events
                .iter()
                .filter(|e| e.disposed_at.year() == year)
                .cloned()
                .collect(),
        }
    }

    pub fn home_currency(&self) -> &CurrencyCode {
        &self.home_currency
    }

    pub fn year(&self) -> Option<i32> {
        self.year
    }

    pub fn events(&self) -> &[DisposalEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_gain(&self) -> Decimal {
        self.events.iter().map(|e| e.gain).sum()
    }

    pub fn short_term_gain(&self) -> Decimal {
        self.events
            .iter()
            .filter(|e| !e.long_term)
            .map(|e| e.gain)
            .sum()
    }

    pub fn long_term_gain(&self) -> Decimal {
        self.events
            .iter()
            .filter(|e| e.long_term)
            .map(|e| e.gain)
            .sum()
    }

    pub fn total_proceeds(&self) -> Decimal {
        self.events.iter().map(|e| e.proceeds).sum()
    }

    pub fn total_cost(&self) -> Decimal {
        self.events.iter().map(|e| e.cost).sum()
    }

    /// Net gain realized on fee payments of any kind.
    pub fn fee_gain(&self) -> Decimal {
        self.events
            .iter()
            .filter(|e| e.kind.is_fee())
            .map(|e| e.gain)
            .sum()
    }

    /// Gain per disposal kind.
    pub fn gain_by_kind(&self) -> BTreeMap<DisposalKind, Decimal> {
        let mut by_kind = BTreeMap::new();
        for e in &self.events {
            *by_kind.entry(e.kind).or_insert(Decimal::ZERO) += e.gain;
        }
        by_kind
    }

    /// One row per lot fragment.
    pub fn extended_rows(&self) -> Vec<ReportRow> {
        self.events.iter().map(ReportRow::from_event).collect()
    }

    /// Consecutive rows that differ only in their amounts are merged:
    /// same kind, exchange, currency, disposal day and holding class.
    pub fn combined_rows(&self) -> Vec<ReportRow> {
        let mut rows: Vec<ReportRow> = Vec::new();
        for row in self.events.iter().map(ReportRow::from_event) {
            match rows.last_mut() {
                Some(last) if same_line(last, &row) => last.absorb(&row),
                _ => rows.push(row),
            }
        }
        rows
    }

    /// The last disposal covered by this report.
    pub fn last_disposal(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.disposed_at).max()
    }
}

fn same_line(a: &ReportRow, b: &ReportRow) -> bool {
    a.kind == b.kind
        && a.exchange == b.exchange
        && a.currency == b.currency
        && a.disposed_on == b.disposed_on
        && a.long_term == b.long_term
}

impl std::fmt::Display for GainsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.year {
            Some(year) => writeln!(f, "=== Capital Gains {} ===", year)?,
            None => writeln!(f, "=== Capital Gains ===")?,
        }
        writeln!(f, "Disposals:        {}", self.events.len())?;
        writeln!(f, "Proceeds:         {} {}", self.total_proceeds(), self.home_currency)?;
        writeln!(f, "Cost Basis:       {} {}", self.total_cost(), self.home_currency)?;
        writeln!(f, "Short-Term Gain:  {} {}", self.short_term_gain(), self.home_currency)?;
        writeln!(f, "Long-Term Gain:   {} {}", self.long_term_gain(), self.home_currency)?;
        writeln!(f, "Fee Gain:         {} {}", self.fee_gain(), self.home_currency)?;
        writeln!(f, "Total Gain:       {} {}", self.total_gain(), self.home_currency)?;

        let rows = self.combined_rows();
        if !rows.is_empty() {
            writeln!(f, "\nDetails:")?;
        }
        for row in rows {
            writeln!(
                f,
                "  {} {:<14} {} {} on {} (bought {}): cost {}, proceeds {}, gain {} [{}]",
                row.disposed_on,
                row.kind.to_string(),
                row.amount,
                row.currency,
                row.exchange,
                row.acquired_on,
                row.cost,
                row.proceeds,
                row.gain,
                if row.long_term { "long" } else { "short" }
            )?;
        }
        Ok(())
    }
}
