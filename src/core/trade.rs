use crate::core::currency::CurrencyCode;
use crate::core::exchange::ExchangeId;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// The effect class of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeKind {
    /// Acquire `primary`, paying `secondary` from outside the ledger.
    Purchase,
    /// Dispose of `primary`, receiving `secondary` outside the ledger.
    Sale,
    /// Dispose of `primary`, receiving `secondary` into the ledger.
    Exchange,
    /// `primary` arrives on the exchange.
    Deposit,
    /// `primary` leaves the exchange.
    Withdrawal,
}

impl TradeKind {
    /// Whether this kind carries a counter leg.
    pub fn has_secondary(self) -> bool {
        matches!(self, Self::Purchase | Self::Sale | Self::Exchange)
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Purchase => "purchase",
            Self::Sale => "sale",
            Self::Exchange => "exchange",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        };
        f.write_str(name)
    }
}

/// An amount of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub currency: CurrencyCode,
    pub amount: Decimal,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<CurrencyCode>) -> Self {
        Self {
            currency: currency.into(),
            amount,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Structural problems with a trade record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TradeError {
    #[error("trade {id}: {kind} amount must be positive, got {amount}")]
    NonPositiveAmount {
        id: Uuid,
        kind: TradeKind,
        amount: Decimal,
    },
    #[error("trade {id}: {kind} requires a secondary leg")]
    MissingSecondary { id: Uuid, kind: TradeKind },
    #[error("trade {id}: {kind} must not carry a secondary leg")]
    UnexpectedSecondary { id: Uuid, kind: TradeKind },
    #[error("trade {id}: secondary amount must not be negative, got {amount}")]
    NegativeSecondary { id: Uuid, amount: Decimal },
    #[error("trade {id}: fee amount must not be negative, got {amount}")]
    NegativeFee { id: Uuid, amount: Decimal },
    #[error("trade {id}: only deposits and withdrawals can be tagged as transfers")]
    TransferOnTrade { id: Uuid },
    #[error("trade {id}: cannot exchange {currency} for itself")]
    SameCurrency { id: Uuid, currency: CurrencyCode },
}

/// A normalized ledger entry as handed over by an import adapter.
///
/// Leg conventions by kind:
///
/// | kind       | `primary`        | `secondary`       |
/// |------------|------------------|-------------------|
/// | Purchase   | acquired asset   | external payment  |
/// | Sale       | disposed asset   | external proceeds |
/// | Exchange   | disposed asset   | received asset    |
/// | Deposit    | incoming asset   | none              |
/// | Withdrawal | outgoing asset   | none              |
///
/// Leg amounts are gross; every fee is an additional, independent
/// outflow. Deposits and withdrawals sharing a `transfer` tag move lots
/// between exchanges and keep their cost basis and acquisition date.
///
/// # Examples
///
/// ```
/// use ccgains::core::trade::{Money, Trade, TradeKind};
/// use chrono::{TimeZone, Utc};
/// use rust_decimal_macros::dec;
///
/// let trade = Trade::purchase(
///     Utc.with_ymd_and_hms(2017, 1, 1, 12, 0, 0).unwrap(),
///     "Kraken",
///     Money::new(dec!(1.0), "BTC"),
///     Money::new(dec!(1000), "EUR"),
/// )
/// .with_fee(Money::new(dec!(10), "EUR"));
///
/// assert_eq!(trade.kind(), TradeKind::Purchase);
/// assert_eq!(trade.fees().len(), 1);
/// assert!(trade.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    kind: TradeKind,
    time: DateTime<Utc>,
    exchange: ExchangeId,
    primary: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secondary: Option<Money>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fees: Vec<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transfer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

impl Trade {
    fn build(
        kind: TradeKind,
        time: DateTime<Utc>,
        exchange: impl Into<ExchangeId>,
        primary: Money,
        secondary: Option<Money>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            time,
            exchange: exchange.into(),
            primary,
            secondary,
            fees: Vec::new(),
            transfer: None,
            comment: None,
        }
    }

    pub fn purchase(
        time: DateTime<Utc>,
        exchange: impl Into<ExchangeId>,
        bought: Money,
        paid: Money,
    ) -> Self {
        Self::build(TradeKind::Purchase, time, exchange, bought, Some(paid))
    }

    pub fn sale(
        time: DateTime<Utc>,
        exchange: impl Into<ExchangeId>,
        sold: Money,
        received: Money,
    ) -> Self {
        Self::build(TradeKind::Sale, time, exchange, sold, Some(received))
    }

    /// An [`TradeKind::Exchange`] trade: one held asset for another.
    pub fn swap(
        time: DateTime<Utc>,
        exchange: impl Into<ExchangeId>,
        sold: Money,
        received: Money,
    ) -> Self {
        Self::build(TradeKind::Exchange, time, exchange, sold, Some(received))
    }

    pub fn deposit(time: DateTime<Utc>, exchange: impl Into<ExchangeId>, amount: Money) -> Self {
        Self::build(TradeKind::Deposit, time, exchange, amount, None)
    }

    pub fn withdrawal(
        time: DateTime<Utc>,
        exchange: impl Into<ExchangeId>,
        amount: Money,
    ) -> Self {
        Self::build(TradeKind::Withdrawal, time, exchange, amount, None)
    }

    /// Replace the generated id (useful for deterministic tests and re-imports).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_fee(mut self, fee: Money) -> Self {
        self.fees.push(fee);
        self
    }

    /// Tag a deposit or withdrawal as one side of a transfer between
    /// the user's own exchanges or wallets.
    pub fn with_transfer(mut self, tag: impl Into<String>) -> Self {
        self.transfer = Some(tag.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Check the structural rules for this trade's kind.
    pub fn validate(&self) -> Result<(), TradeError> {
        if self.primary.amount <= Decimal::ZERO {
            return Err(TradeError::NonPositiveAmount {
                id: self.id,
                kind: self.kind,
                amount: self.primary.amount,
            });
        }
        match (&self.secondary, self.kind.has_secondary()) {
            (None, true) => {
                return Err(TradeError::MissingSecondary {
                    id: self.id,
                    kind: self.kind,
                })
            }
            (Some(_), false) => {
                return Err(TradeError::UnexpectedSecondary {
                    id: self.id,
                    kind: self.kind,
                })
            }
            (Some(secondary), true) => {
                if secondary.amount < Decimal::ZERO {
                    return Err(TradeError::NegativeSecondary {
                        id: self.id,
                        amount: secondary.amount,
                    });
                }
                if secondary.currency == self.primary.currency {
                    return Err(TradeError::SameCurrency {
                        id: self.id,
                        currency: secondary.currency.clone(),
                    });
                }
            }
            (None, false) => {}
        }
        if let Some(fee) = self.fees.iter().find(|f| f.amount < Decimal::ZERO) {
            return Err(TradeError::NegativeFee {
                id: self.id,
                amount: fee.amount,
            });
        }
        if self.transfer.is_some() && self.kind.has_secondary() {
            return Err(TradeError::TransferOnTrade { id: self.id });
        }
        Ok(())
    }

    // --- Accessors ---

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TradeKind {
        self.kind
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn exchange(&self) -> &ExchangeId {
        &self.exchange
    }

    pub fn primary(&self) -> &Money {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Money> {
        self.secondary.as_ref()
    }

    /// Fees with a non-zero amount.
    pub fn fees(&self) -> Vec<&Money> {
        self.fees
            .iter()
            .filter(|f| f.amount != Decimal::ZERO)
            .collect()
    }

    pub fn transfer(&self) -> Option<&str> {
        self.transfer.as_deref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} on {}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.primary,
            self.exchange
        )?;
        if let Some(secondary) = &self.secondary {
            write!(f, " for {}", secondary)?;
        }
        for fee in self.fees() {
            write!(f, " (fee {})", fee)?;
        }
        if let Some(tag) = &self.transfer {
            write!(f, " [transfer {}]", tag)?;
        }
        Ok(())
    }
}

/// An ordered collection of trades to be fed to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeHistory {
    trades: Vec<Trade>,
}

impl TradeHistory {
    pub fn new() -> Self {
        Self { trades: Vec::new() }
    }

    pub fn add(&mut self, trade: Trade) {
        self.trades.push(trade);
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Sort by time. The sort is stable, so trades at the same instant
    /// keep their import order.
    pub fn sort(&mut self) {
        self.trades.sort_by_key(|t| t.time());
    }

    /// Trades falling into a calendar year (UTC).
    pub fn for_year(&self, year: i32) -> Vec<&Trade> {
        self.trades.iter().filter(|t| t.time().year() == year).collect()
    }

    /// All currencies referenced by any leg or fee.
    pub fn currencies(&self) -> Vec<CurrencyCode> {
        let mut currencies: Vec<CurrencyCode> = self
            .trades
            .iter()
            .flat_map(|t| {
                std::iter::once(t.primary.currency.clone())
                    .chain(t.secondary.iter().map(|s| s.currency.clone()))
                    .chain(t.fees.iter().map(|f| f.currency.clone()))
            })
            .collect();
        currencies.sort();
        currencies.dedup();
        currencies
    }

    /// All exchanges referenced by the history.
    pub fn exchanges(&self) -> Vec<ExchangeId> {
        let mut exchanges: Vec<ExchangeId> =
            self.trades.iter().map(|t| t.exchange.clone()).collect();
        exchanges.sort();
        exchanges.dedup();
        exchanges
    }
}

impl FromIterator<Trade> for TradeHistory {
    fn from_iter<T: IntoIterator<Item = Trade>>(iter: T) -> Self {
        Self {
            trades: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TradeHistory {
    type Item = Trade;
    type IntoIter = std::vec::IntoIter<Trade>;

    fn into_iter(self) -> Self::IntoIter {
        self.trades.into_iter()
    }
}
