use crate::core::currency::CurrencyCode;
use crate::core::exchange::ExchangeId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Decimal places kept for home-currency values such as costs and
/// proceeds. A share of a value is rounded to this scale and the last
/// share takes what is left, so shares always add up exactly.
pub const VALUE_DP: u32 = 12;

/// Errors raised by lot queues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LotError {
    /// The queue holds less than requested. This means a trade is
    /// missing, was imported wrongly, or arrived out of order.
    #[error("insufficient funds: requested {requested} {key}, but only {available} available")]
    InsufficientFunds {
        key: LotKey,
        requested: Decimal,
        available: Decimal,
    },
}

/// Address of a lot queue: one currency on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LotKey {
    pub currency: CurrencyCode,
    pub exchange: ExchangeId,
}

impl LotKey {
    pub fn new(currency: impl Into<CurrencyCode>, exchange: impl Into<ExchangeId>) -> Self {
        Self {
            currency: currency.into(),
            exchange: exchange.into(),
        }
    }
}

impl fmt::Display for LotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.currency, self.exchange)
    }
}

/// An amount of one currency acquired at one instant at one cost basis.
///
/// `unit_cost` is the home-currency price paid per unit, fees included.
/// `cost` is the remaining total cost basis; it is carried explicitly so
/// that splitting never loses value to rounding: the two halves of a
/// split always add up to the original cost.
///
/// # Examples
///
/// ```
/// use ccgains::core::lot::Lot;
/// use chrono::{TimeZone, Utc};
/// use rust_decimal_macros::dec;
///
/// let bought = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
/// let lot = Lot::new("BTC", "Kraken", dec!(1.0), dec!(1010), bought);
///
/// let (taken, rest) = lot.split(dec!(0.4));
/// assert_eq!(taken.cost(), dec!(404));
/// let rest = rest.unwrap();
/// assert_eq!(rest.amount(), dec!(0.6));
/// assert_eq!(rest.unit_cost(), dec!(1010));
/// assert_eq!(rest.acquired_at(), bought);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    currency: CurrencyCode,
    exchange: ExchangeId,
    amount: Decimal,
    unit_cost: Decimal,
    cost: Decimal,
    acquired_at: DateTime<Utc>,
}

impl Lot {
    /// Create a lot from its unit cost.
    ///
    /// # Panics
    ///
    /// Panics if `amount` is not positive.
    pub fn new(
        currency: impl Into<CurrencyCode>,
        exchange: impl Into<ExchangeId>,
        amount: Decimal,
        unit_cost: Decimal,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        assert!(
            amount > Decimal::ZERO,
            "Lot amount must be positive, got {}",
            amount
        );
        Self {
            currency: currency.into(),
            exchange: exchange.into(),
            amount,
            unit_cost,
            cost: (amount * unit_cost).round_dp(VALUE_DP),
            acquired_at,
        }
    }

    /// Create a lot from the total cost paid for it.
    ///
    /// # Panics
    ///
    /// Panics if `amount` is not positive.
    pub fn with_cost(
        currency: impl Into<CurrencyCode>,
        exchange: impl Into<ExchangeId>,
        amount: Decimal,
        cost: Decimal,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        assert!(
            amount > Decimal::ZERO,
            "Lot amount must be positive, got {}",
            amount
        );
        let cost = cost.round_dp(VALUE_DP);
        Self {
            currency: currency.into(),
            exchange: exchange.into(),
            amount,
            unit_cost: cost / amount,
            cost,
            acquired_at,
        }
    }

    /// Split off `amount` units. Returns the taken part and the remainder,
    /// if any. Unit cost and acquisition date carry over to both parts.
    ///
    /// # Panics
    ///
    /// Panics if `amount` is not positive or exceeds the lot.
    pub fn split(self, amount: Decimal) -> (Lot, Option<Lot>) {
        assert!(
            amount > Decimal::ZERO && amount <= self.amount,
            "cannot split {} out of a lot of {}",
            amount,
            self.amount
        );
        if amount == self.amount {
            return (self, None);
        }
        let taken_cost = (amount * self.unit_cost).round_dp(VALUE_DP);
        let rest = Lot {
            amount: self.amount - amount,
            cost: self.cost - taken_cost,
            ..self.clone()
        };
        let taken = Lot {
            amount,
            cost: taken_cost,
            ..self
        };
        (taken, Some(rest))
    }

    /// The same lot held on another exchange.
    pub fn moved_to(self, exchange: ExchangeId) -> Lot {
        Lot { exchange, ..self }
    }

    // --- Accessors ---

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn exchange(&self) -> &ExchangeId {
        &self.exchange
    }

    pub fn key(&self) -> LotKey {
        LotKey::new(self.currency.clone(), self.exchange.clone())
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn unit_cost(&self) -> Decimal {
        self.unit_cost
    }

    pub fn cost(&self) -> Decimal {
        self.cost
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl fmt::Display for Lot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {} @ {} (bought {})",
            self.amount,
            self.currency,
            self.exchange,
            self.unit_cost,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// FIFO queue of lots for one currency on one exchange.
///
/// Lots are kept sorted by acquisition time; lots acquired at the same
/// instant stay in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotQueue {
    key: LotKey,
    lots: VecDeque<Lot>,
}

impl LotQueue {
    pub fn new(key: LotKey) -> Self {
        Self {
            key,
            lots: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &LotKey {
        &self.key
    }

    /// Add a newly acquired lot.
    ///
    /// # Panics
    ///
    /// Panics if `amount` is not positive.
    pub fn add(&mut self, amount: Decimal, unit_cost: Decimal, acquired_at: DateTime<Utc>) {
        let lot = Lot::new(
            self.key.currency.clone(),
            self.key.exchange.clone(),
            amount,
            unit_cost,
            acquired_at,
        );
        self.add_lot(lot);
    }

    /// Insert an existing lot (e.g. one arriving from a transfer). The
    /// lot is re-homed to this queue's exchange and keeps its
    /// acquisition date, so it may land in front of younger lots.
    pub fn add_lot(&mut self, lot: Lot) {
        debug_assert_eq!(lot.currency(), &self.key.currency);
        let lot = lot.moved_to(self.key.exchange.clone());
        let at = self
            .lots
            .partition_point(|l| l.acquired_at() <= lot.acquired_at());
        self.lots.insert(at, lot);
    }

    /// Take `amount` from the oldest lots first. The returned fragments
    /// are in consumption order and sum to exactly `amount`; the last
    /// lot touched is split if only partially used.
    ///
    /// Nothing is taken if the queue holds less than `amount`.
    pub fn spend(&mut self, amount: Decimal) -> Result<Vec<Lot>, LotError> {
        let available = self.total();
        if amount > available {
            return Err(LotError::InsufficientFunds {
                key: self.key.clone(),
                requested: amount,
                available,
            });
        }

        let mut fragments = Vec::new();
        let mut to_pay = amount;
        while to_pay > Decimal::ZERO {
            let Some(lot) = self.lots.pop_front() else {
                break;
            };
            if lot.amount() <= to_pay {
                to_pay -= lot.amount();
                fragments.push(lot);
            } else {
                let (taken, rest) = lot.split(to_pay);
                to_pay = Decimal::ZERO;
                fragments.push(taken);
                if let Some(rest) = rest {
                    self.lots.push_front(rest);
                }
            }
        }
        Ok(fragments)
    }

    /// Total amount held.
    pub fn total(&self) -> Decimal {
        self.lots.iter().map(|l| l.amount()).sum()
    }

    /// Total remaining cost basis.
    pub fn total_cost(&self) -> Decimal {
        self.lots.iter().map(|l| l.cost()).sum()
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter()
    }

    pub fn oldest(&self) -> Option<&Lot> {
        self.lots.front()
    }

    pub fn len(&self) -> usize {
        self.lots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }
}
