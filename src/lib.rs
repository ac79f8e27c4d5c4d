//! # ccgains
//!
//! FIFO capital gains engine for cryptocurrency and fiat trade ledgers.
//!
//! Given a chronological list of trades, the engine tracks every lot of
//! currency held per exchange, consumes the oldest lots first on each
//! disposal, and realizes a gain or loss in the home currency for every
//! lot fragment spent. Fees are disposals in their own right.
//!
//! ## Architecture
//!
//! - **core**: foundational types (currencies, exchanges, trades, lots)
//! - **rates**: historical rate series and the currency graph resolving
//!   any pair at any instant
//! - **ledger**: the FIFO engine, its persisted state, disposal events
//!   and gains reports
//! - **simulation**: random trade histories for benchmarks and stress tests

pub mod core;
pub mod ledger;
pub mod rates;
pub mod simulation;

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::core::currency::{CurrencyCode, CurrencyPair};
    pub use crate::core::exchange::ExchangeId;
    pub use crate::core::lot::{Lot, LotKey, LotQueue};
    pub use crate::core::trade::{Money, Trade, TradeHistory, TradeKind};
    pub use crate::ledger::config::{EngineConfig, HoldingPeriod};
    pub use crate::ledger::disposal::{DisposalEvent, DisposalKind};
    pub use crate::ledger::engine::{LedgerEngine, LedgerError};
    pub use crate::ledger::report::GainsReport;
    pub use crate::ledger::state::{EngineState, JsonFileStore, MemoryStore, SnapshotStore};
    pub use crate::rates::graph::RateGraph;
    pub use crate::rates::series::{RateError, RateSeries, RateSource};
}
