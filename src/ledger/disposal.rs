use crate::core::currency::CurrencyCode;
use crate::core::exchange::ExchangeId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why a lot fragment left the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DisposalKind {
    Sale,
    Exchange,
    /// Withdrawn to somewhere outside the ledger.
    Withdrawal,
    TradeFee,
    WithdrawalFee,
    /// Charged on a deposit, including an incoming transfer that arrives
    /// with less than was sent.
    DepositFee,
}

impl DisposalKind {
    pub fn is_fee(self) -> bool {
        matches!(self, Self::TradeFee | Self::WithdrawalFee | Self::DepositFee)
    }
}

impl fmt::Display for DisposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sale => "sale",
            Self::Exchange => "exchange",
            Self::Withdrawal => "withdrawal",
            Self::TradeFee => "trade fee",
            Self::WithdrawalFee => "withdrawal fee",
            Self::DepositFee => "deposit fee",
        };
        f.write_str(name)
    }
}

/// A realized gain or loss on one lot fragment.
///
/// `proceeds` and `gain` are in the home currency; `rate` is the
/// home-currency value per unit the proceeds were based on (the market
/// rate for fees and withdrawals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisposalEvent {
    pub trade_id: Uuid,
    pub kind: DisposalKind,
    pub exchange: ExchangeId,
    pub currency: CurrencyCode,
    pub amount: Decimal,
    pub unit_cost: Decimal,
    pub cost: Decimal,
    pub acquired_at: DateTime<Utc>,
    pub disposed_at: DateTime<Utc>,
    pub rate: Decimal,
    pub proceeds: Decimal,
    pub gain: Decimal,
    pub long_term: bool,
}

impl DisposalEvent {
    /// Whole days between acquisition and disposal.
    pub fn holding_days(&self) -> i64 {
        (self.disposed_at - self.acquired_at).num_days()
    }
}

impl fmt::Display for DisposalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} on {}: cost {}, proceeds {}, gain {} ({})",
            self.disposed_at.format("%Y-%m-%d"),
            self.kind,
            self.amount,
            self.currency,
            self.exchange,
            self.cost,
            self.proceeds,
            self.gain,
            if self.long_term { "long" } else { "short" }
        )
    }
}
