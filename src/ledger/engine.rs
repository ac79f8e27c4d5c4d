use crate::core::currency::CurrencyCode;
use crate::core::exchange::ExchangeId;
use crate::core::lot::{Lot, LotError, LotKey, LotQueue, VALUE_DP};
use crate::core::trade::{Money, Trade, TradeError, TradeKind};
use crate::ledger::config::EngineConfig;
use crate::ledger::disposal::{DisposalEvent, DisposalKind};
use crate::ledger::state::{EngineState, SnapshotStore, StateTransaction};
use crate::rates::graph::RateGraph;
use crate::rates::series::RateError;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors that abort processing. None of them is recovered from.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Rate(#[from] RateError),

    #[error(transparent)]
    Lot(#[from] LotError),

    #[error(transparent)]
    InvalidTrade(#[from] TradeError),

    #[error("trade {id} at {time} is older than the last processed trade at {last}")]
    OutOfOrderTrade {
        id: Uuid,
        time: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("unsupported state version {found}, expected {expected}")]
    StateVersionMismatch { found: u32, expected: u32 },

    #[error("state was recorded in {found}, but the engine reports in {expected}")]
    HomeCurrencyMismatch {
        found: CurrencyCode,
        expected: CurrencyCode,
    },

    #[error("transfer '{tag}': {reason}")]
    TransferMismatch { tag: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A fee converted into the home currency.
struct ValuedFee<'a> {
    money: &'a Money,
    rate: Decimal,
    value: Decimal,
}

/// The FIFO capital gains engine.
///
/// Trades are fed in chronological order. Every acquisition becomes a
/// lot on the exchange it happened on; every disposal consumes the
/// oldest lots of that currency and exchange first and realizes one
/// [`DisposalEvent`] per lot fragment touched. Fees paid in a tracked
/// currency are disposals too.
///
/// # Examples
///
/// ```
/// use ccgains::prelude::*;
/// use chrono::{Duration, TimeZone, Utc};
/// use rust_decimal_macros::dec;
///
/// let day0 = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
/// let mut engine = LedgerEngine::new(EngineConfig::default(), RateGraph::default());
///
/// engine.process_trade(
///     &Trade::purchase(day0, "Kraken", Money::new(dec!(1.0), "BTC"), Money::new(dec!(1000), "EUR"))
///         .with_fee(Money::new(dec!(10), "EUR")),
/// ).unwrap();
/// let events = engine.process_trade(&Trade::sale(
///     day0 + Duration::days(400),
///     "Kraken",
///     Money::new(dec!(0.4), "BTC"),
///     Money::new(dec!(500), "EUR"),
/// )).unwrap();
///
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].cost, dec!(404));
/// assert_eq!(events[0].gain, dec!(96));
/// assert!(events[0].long_term);
/// ```
pub struct LedgerEngine {
    config: EngineConfig,
    rates: RateGraph,
    state: EngineState,
    events: Vec<DisposalEvent>,
    store: Option<Box<dyn SnapshotStore>>,
}

impl LedgerEngine {
    pub fn new(config: EngineConfig, rates: RateGraph) -> Self {
        let state = EngineState::new(config.home_currency.clone());
        Self {
            config,
            rates,
            state,
            events: Vec::new(),
            store: None,
        }
    }

    /// Continue from a previously saved state.
    pub fn with_state(
        config: EngineConfig,
        rates: RateGraph,
        state: EngineState,
    ) -> Result<Self, LedgerError> {
        if state.home_currency() != &config.home_currency {
            return Err(LedgerError::HomeCurrencyMismatch {
                found: state.home_currency().clone(),
                expected: config.home_currency.clone(),
            });
        }
        Ok(Self {
            config,
            rates,
            state,
            events: Vec::new(),
            store: None,
        })
    }

    /// Hand the state to `store` before every trade.
    pub fn with_store(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn into_state(self) -> EngineState {
        self.state
    }

    pub fn rates(&self) -> &RateGraph {
        &self.rates
    }

    pub fn rates_mut(&mut self) -> &mut RateGraph {
        &mut self.rates
    }

    /// Disposals realized so far, in processing order.
    pub fn events(&self) -> &[DisposalEvent] {
        &self.events
    }

    /// Hand over the realized disposals, leaving the log empty.
    pub fn take_events(&mut self) -> Vec<DisposalEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn balance(&self, currency: &CurrencyCode, exchange: &ExchangeId) -> Decimal {
        self.state.balance(currency, exchange)
    }

    /// The trades of a time-sorted list that the current state does not
    /// reflect yet.
    pub fn pending<'a>(&self, trades: &'a [Trade]) -> &'a [Trade] {
        let Some(last) = self.state.last_trade_at() else {
            return trades;
        };
        let before = trades.partition_point(|t| t.time() < last);
        let through = trades.partition_point(|t| t.time() <= last);
        let start = (before + self.state.processed_at_last()).min(through);
        &trades[start..]
    }

    /// Process trades in order. Returns the number of disposals realized.
    pub fn process_all(&mut self, trades: &[Trade]) -> Result<usize, LedgerError> {
        let before = self.events.len();
        for trade in trades {
            self.process_trade(trade)?;
        }
        let realized = self.events.len() - before;
        info!(
            "processed {} trades, {} disposals realized",
            trades.len(),
            realized
        );
        Ok(realized)
    }

    /// Apply one trade. On success returns the disposals it realized;
    /// on failure state and event log are left as they were.
    pub fn process_trade(&mut self, trade: &Trade) -> Result<&[DisposalEvent], LedgerError> {
        trade.validate()?;
        if let Some(last) = self.state.last_trade_at() {
            if trade.time() < last {
                return Err(LedgerError::OutOfOrderTrade {
                    id: trade.id(),
                    time: trade.time(),
                    last,
                });
            }
        }
        if let Some(store) = self.store.as_mut() {
            store.store(&self.state)?;
        }

        debug!("processing {}", trade);
        let placeholder = EngineState::new(self.config.home_currency.clone());
        let mut state = std::mem::replace(&mut self.state, placeholder);
        let mut events = Vec::new();
        let applied = {
            let mut tx = StateTransaction::begin(&mut state);
            let applied = self.apply(trade, &mut tx, &mut events);
            if applied.is_ok() {
                tx.commit(trade.time());
            }
            applied
        };
        self.state = state;
        applied?;

        let start = self.events.len();
        self.events.extend(events);
        Ok(&self.events[start..])
    }

    fn apply(
        &mut self,
        trade: &Trade,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        match trade.kind() {
            TradeKind::Purchase | TradeKind::Sale | TradeKind::Exchange => {
                self.apply_trade(trade, state, events)
            }
            TradeKind::Deposit => self.apply_deposit(trade, state, events),
            TradeKind::Withdrawal => self.apply_withdrawal(trade, state, events),
        }
    }

    fn home(&self) -> &CurrencyCode {
        &self.config.home_currency
    }

    fn is_home(&self, currency: &CurrencyCode) -> bool {
        currency == &self.config.home_currency
    }

    /// Home-currency units per unit of `currency` at `time`.
    fn home_rate(
        &mut self,
        currency: &CurrencyCode,
        time: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        if self.is_home(currency) {
            return Ok(Decimal::ONE);
        }
        let home = self.config.home_currency.clone();
        Ok(self.rates.rate(currency, &home, time)?)
    }

    /// Home-currency value of `money` at `time`, at value scale.
    fn home_value(
        &mut self,
        money: &Money,
        time: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        Ok((money.amount * self.home_rate(&money.currency, time)?).round_dp(VALUE_DP))
    }

    fn value_fees<'a>(&mut self, trade: &'a Trade) -> Result<Vec<ValuedFee<'a>>, LedgerError> {
        let mut valued = Vec::new();
        for money in trade.fees() {
            let rate = self.home_rate(&money.currency, trade.time())?;
            valued.push(ValuedFee {
                money,
                rate,
                value: (money.amount * rate).round_dp(VALUE_DP),
            });
        }
        Ok(valued)
    }

    /// Purchase, Sale and Exchange.
    fn apply_trade(
        &mut self,
        trade: &Trade,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        let primary = trade.primary();
        let secondary = match trade.secondary() {
            Some(secondary) => secondary,
            None => {
                return Err(TradeError::MissingSecondary {
                    id: trade.id(),
                    kind: trade.kind(),
                }
                .into())
            }
        };
        let fees = self.value_fees(trade)?;
        let fee_value: Decimal = fees.iter().map(|f| f.value).sum();

        // The external leg of a purchase or sale is never held here.
        let external = match trade.kind() {
            TradeKind::Purchase | TradeKind::Sale => Some(&secondary.currency),
            _ => None,
        };

        match trade.kind() {
            TradeKind::Purchase => {
                let paid = self.home_value(secondary, trade.time())?;
                self.acquire(trade, primary, paid + fee_value, state);
            }
            TradeKind::Sale => {
                let received = self.home_value(secondary, trade.time())?;
                self.dispose(trade, DisposalKind::Sale, received, fee_value, state, events)?;
            }
            TradeKind::Exchange if self.is_home(&primary.currency) => {
                // buying with home currency
                self.acquire(trade, secondary, primary.amount + fee_value, state);
            }
            TradeKind::Exchange if self.is_home(&secondary.currency) => {
                // selling for home currency
                self.dispose(trade, DisposalKind::Exchange, secondary.amount, fee_value, state, events)?;
            }
            _ => {
                let received = self.home_value(secondary, trade.time())?;
                self.dispose(trade, DisposalKind::Exchange, received, fee_value, state, events)?;
                self.acquire(trade, secondary, received, state);
            }
        }

        for fee in fees {
            if self.is_home(&fee.money.currency) || external == Some(&fee.money.currency) {
                continue;
            }
            let fragments = spend(state, &fee.money.currency, trade.exchange(), fee.money.amount)?;
            self.realize(
                trade,
                DisposalKind::TradeFee,
                fragments,
                fee.rate,
                fee.value,
                events,
            );
        }
        Ok(())
    }

    /// Book a new lot costing `cost` in home currency. Home currency
    /// itself is not tracked.
    fn acquire(
        &self,
        trade: &Trade,
        money: &Money,
        cost: Decimal,
        state: &mut StateTransaction<'_>,
    ) {
        if self.is_home(&money.currency) || money.amount <= Decimal::ZERO {
            debug!("{}: nothing to book for {}", trade.id(), money);
            return;
        }
        let lot = Lot::with_cost(
            money.currency.clone(),
            trade.exchange().clone(),
            money.amount,
            cost,
            trade.time(),
        );
        debug!("{}: new lot {}", trade.id(), lot);
        state
            .queue_mut(&LotKey::new(money.currency.clone(), trade.exchange().clone()))
            .add_lot(lot);
    }

    /// Spend the primary leg and realize `gross - fee_value` as proceeds.
    fn dispose(
        &self,
        trade: &Trade,
        kind: DisposalKind,
        gross: Decimal,
        fee_value: Decimal,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        let primary = trade.primary();
        if self.is_home(&primary.currency) {
            debug!("{}: {} leaves untracked", trade.id(), primary);
            return Ok(());
        }
        let fragments = spend(state, &primary.currency, trade.exchange(), primary.amount)?;
        let rate = gross / primary.amount;
        self.realize(trade, kind, fragments, rate, gross - fee_value, events);
        Ok(())
    }

    fn apply_deposit(
        &mut self,
        trade: &Trade,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        let money = trade.primary();
        if self.is_home(&money.currency) {
            debug!("{}: home currency deposit ignored", trade.id());
        } else if let Some(tag) = trade.transfer() {
            self.receive_transfer(trade, tag, state, events)?;
        } else {
            let rate = self.home_rate(&money.currency, trade.time())?;
            let lot = Lot::new(
                money.currency.clone(),
                trade.exchange().clone(),
                money.amount,
                rate,
                trade.time(),
            );
            state.queue_mut(&lot.key()).add_lot(lot);
        }
        self.realize_transfer_fees(trade, DisposalKind::DepositFee, state, events)
    }

    fn receive_transfer(
        &mut self,
        trade: &Trade,
        tag: &str,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        let money = trade.primary();
        let mismatch = |reason: String| LedgerError::TransferMismatch {
            tag: tag.to_string(),
            reason,
        };
        let lots = state
            .take_in_transit(tag)
            .ok_or_else(|| mismatch("no matching withdrawal in transit".to_string()))?;
        if let Some(lot) = lots.iter().find(|l| l.currency() != &money.currency) {
            return Err(mismatch(format!(
                "withdrew {} but deposited {}",
                lot.currency(),
                money.currency
            )));
        }

        let key = LotKey::new(money.currency.clone(), trade.exchange().clone());
        let mut arriving = LotQueue::new(key.clone());
        for lot in lots {
            arriving.add_lot(lot);
        }
        let sent = arriving.total();
        if money.amount > sent {
            return Err(mismatch(format!(
                "deposited {} {} but only {} were sent",
                money.amount, money.currency, sent
            )));
        }
        if money.amount < sent {
            let lost = arriving.spend(sent - money.amount)?;
            let rate = self.home_rate(&money.currency, trade.time())?;
            let value = ((sent - money.amount) * rate).round_dp(VALUE_DP);
            self.realize(trade, DisposalKind::DepositFee, lost, rate, value, events);
        }

        let queue = state.queue_mut(&key);
        for lot in arriving.lots() {
            queue.add_lot(lot.clone());
        }
        debug!("{}: transfer '{}' arrived on {}", trade.id(), tag, trade.exchange());
        Ok(())
    }

    fn apply_withdrawal(
        &mut self,
        trade: &Trade,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        let money = trade.primary();
        if self.is_home(&money.currency) {
            debug!("{}: home currency withdrawal ignored", trade.id());
        } else {
            let fragments = spend(state, &money.currency, trade.exchange(), money.amount)?;
            match trade.transfer() {
                Some(tag) => {
                    if !state.hold_in_transit(tag, fragments) {
                        return Err(LedgerError::TransferMismatch {
                            tag: tag.to_string(),
                            reason: "tag is already in transit".to_string(),
                        });
                    }
                }
                None => {
                    let rate = self.home_rate(&money.currency, trade.time())?;
                    self.realize(
                        trade,
                        DisposalKind::Withdrawal,
                        fragments,
                        rate,
                        (money.amount * rate).round_dp(VALUE_DP),
                        events,
                    );
                }
            }
        }
        self.realize_transfer_fees(trade, DisposalKind::WithdrawalFee, state, events)
    }

    /// Fees on deposits and withdrawals are paid out of the account like a
    /// sale at the market rate.
    fn realize_transfer_fees(
        &mut self,
        trade: &Trade,
        kind: DisposalKind,
        state: &mut StateTransaction<'_>,
        events: &mut Vec<DisposalEvent>,
    ) -> Result<(), LedgerError> {
        for fee in self.value_fees(trade)? {
            if self.is_home(&fee.money.currency) {
                debug!("{}: ignoring {} fee {}", trade.id(), self.home(), fee.money);
                continue;
            }
            let fragments = spend(state, &fee.money.currency, trade.exchange(), fee.money.amount)?;
            self.realize(trade, kind, fragments, fee.rate, fee.value, events);
        }
        Ok(())
    }

    /// Turn spent fragments into events. `proceeds` is shared pro rata
    /// over the fragments at value scale; the last one takes the remainder
    /// so the shares add up exactly.
    fn realize(
        &self,
        trade: &Trade,
        kind: DisposalKind,
        fragments: Vec<Lot>,
        rate: Decimal,
        proceeds: Decimal,
        events: &mut Vec<DisposalEvent>,
    ) {
        let total: Decimal = fragments.iter().map(|l| l.amount()).sum();
        let count = fragments.len();
        let mut assigned = Decimal::ZERO;

        for (i, lot) in fragments.into_iter().enumerate() {
            let share = if i + 1 == count {
                proceeds - assigned
            } else {
                (proceeds * lot.amount() / total).round_dp(VALUE_DP)
            };
            assigned += share;

            let event = DisposalEvent {
                trade_id: trade.id(),
                kind,
                exchange: trade.exchange().clone(),
                currency: lot.currency().clone(),
                amount: lot.amount(),
                unit_cost: lot.unit_cost(),
                cost: lot.cost(),
                acquired_at: lot.acquired_at(),
                disposed_at: trade.time(),
                rate,
                proceeds: share,
                gain: share - lot.cost(),
                long_term: self
                    .config
                    .holding_period
                    .is_long_term(lot.acquired_at(), trade.time()),
            };
            debug!("{}: {}", trade.id(), event);
            events.push(event);
        }
    }
}

fn spend(
    state: &mut StateTransaction<'_>,
    currency: &CurrencyCode,
    exchange: &ExchangeId,
    amount: Decimal,
) -> Result<Vec<Lot>, LotError> {
    state
        .queue_mut(&LotKey::new(currency.clone(), exchange.clone()))
        .spend(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::CurrencyPair;
    use crate::ledger::config::HoldingPeriod;
    use crate::ledger::state::MemoryStore;
    use crate::rates::series::RateSeries;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn flat(base: &str, quote: &str, rate: Decimal) -> RateSeries {
        RateSeries::with_samples(CurrencyPair::new(base, quote), vec![(day(0), rate)]).unwrap()
    }

    fn engine() -> LedgerEngine {
        let rates = RateGraph::from_series(
            vec![
                flat("BTC", "EUR", dec!(1000)),
                flat("XMR", "BTC", dec!(0.01)),
                flat("USD", "EUR", dec!(0.8)),
            ],
            Duration::days(10_000),
        );
        LedgerEngine::new(EngineConfig::default(), rates)
    }

    fn btc(amount: Decimal) -> Money {
        Money::new(amount, "BTC")
    }

    fn eur(amount: Decimal) -> Money {
        Money::new(amount, "EUR")
    }

    fn cur(code: &str) -> CurrencyCode {
        CurrencyCode::new(code)
    }

    fn kraken() -> ExchangeId {
        ExchangeId::new("Kraken")
    }

    #[test]
    fn test_purchase_capitalizes_fee() {
        let mut e = engine();
        e.process_trade(
            &Trade::purchase(day(0), "Kraken", btc(dec!(1.0)), eur(dec!(1000)))
                .with_fee(eur(dec!(10))),
        )
        .unwrap();

        let queue = e.state().queue(&LotKey::new("BTC", "Kraken")).unwrap();
        let lot = queue.oldest().unwrap();
        assert_eq!(lot.amount(), dec!(1.0));
        assert_eq!(lot.unit_cost(), dec!(1010));
        assert_eq!(lot.acquired_at(), day(0));
        assert!(e.events().is_empty());
    }

    #[test]
    fn test_partial_sale_long_term() {
        let mut e = engine();
        e.process_trade(
            &Trade::purchase(day(0), "Kraken", btc(dec!(1.0)), eur(dec!(1000)))
                .with_fee(eur(dec!(10))),
        )
        .unwrap();
        let events = e
            .process_trade(&Trade::sale(day(400), "Kraken", btc(dec!(0.4)), eur(dec!(500))))
            .unwrap()
            .to_vec();

        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.kind, DisposalKind::Sale);
        assert_eq!(ev.amount, dec!(0.4));
        assert_eq!(ev.cost, dec!(404));
        assert_eq!(ev.proceeds, dec!(500));
        assert_eq!(ev.gain, dec!(96));
        assert!(ev.long_term);

        let rest = e
            .state()
            .queue(&LotKey::new("BTC", "Kraken"))
            .unwrap()
            .oldest()
            .unwrap()
            .clone();
        assert_eq!(rest.amount(), dec!(0.6));
        assert_eq!(rest.unit_cost(), dec!(1010));
        assert_eq!(rest.acquired_at(), day(0));
    }

    #[test]
    fn test_sale_fee_reduces_proceeds_across_fragments() {
        let mut e = engine();
        e.process_trade(&Trade::purchase(day(0), "Kraken", btc(dec!(1)), eur(dec!(900))))
            .unwrap();
        e.process_trade(&Trade::purchase(day(1), "Kraken", btc(dec!(2)), eur(dec!(2000))))
            .unwrap();
        let events = e
            .process_trade(
                &Trade::sale(day(2), "Kraken", btc(dec!(3)), eur(dec!(3000)))
                    .with_fee(eur(dec!(30))),
            )
            .unwrap()
            .to_vec();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].proceeds, dec!(990));
        assert_eq!(events[1].proceeds, dec!(1980));
        let gain: Decimal = events.iter().map(|ev| ev.gain).sum();
        assert_eq!(gain, dec!(3000) - dec!(30) - dec!(2900));
        assert!(events.iter().all(|ev| !ev.long_term));
    }

    #[test]
    fn test_pro_rata_shares_add_up_exactly() {
        let mut e = engine();
        for n in 0..3 {
            e.process_trade(&Trade::purchase(day(n), "Kraken", btc(dec!(1)), eur(dec!(333.33))))
                .unwrap();
        }
        let events = e
            .process_trade(&Trade::sale(day(3), "Kraken", btc(dec!(3)), eur(dec!(1000))))
            .unwrap()
            .to_vec();

        let shares: Vec<Decimal> = events.iter().map(|ev| ev.proceeds).collect();
        assert_eq!(
            shares,
            vec![dec!(333.333333333333), dec!(333.333333333333), dec!(333.333333333334)]
        );
        let gain: Decimal = events.iter().map(|ev| ev.gain).sum();
        assert_eq!(gain, dec!(1000) - dec!(999.99));
    }

    #[test]
    fn test_exchange_creates_received_lot_at_market_value() {
        let mut e = engine();
        e.process_trade(&Trade::purchase(day(0), "Poloniex", btc(dec!(1)), eur(dec!(800))))
            .unwrap();
        let events = e
            .process_trade(
                &Trade::swap(day(5), "Poloniex", btc(dec!(1)), Money::new(dec!(100), "XMR"))
                    .with_fee(Money::new(dec!(1), "XMR")),
            )
            .unwrap()
            .to_vec();

        // 100 XMR at 10 EUR each, minus a 10 EUR fee
        assert_eq!(events[0].kind, DisposalKind::Exchange);
        assert_eq!(events[0].proceeds, dec!(990));
        assert_eq!(events[0].gain, dec!(190));

        // the fee is paid from the freshly received XMR
        assert_eq!(events[1].kind, DisposalKind::TradeFee);
        assert_eq!(events[1].amount, dec!(1));
        assert_eq!(events[1].cost, dec!(10));
        assert_eq!(events[1].gain, Decimal::ZERO);

        let xmr = e.state().queue(&LotKey::new("XMR", "Poloniex")).unwrap();
        assert_eq!(xmr.total(), dec!(99));
        assert_eq!(xmr.total_cost(), dec!(990));
    }

    #[test]
    fn test_exchange_with_home_currency_legs() {
        let mut e = engine();
        e.process_trade(&Trade::swap(day(0), "Kraken", eur(dec!(500)), btc(dec!(0.5))))
            .unwrap();
        assert_eq!(e.balance(&cur("BTC"), &kraken()), dec!(0.5));
        assert_eq!(e.balance(&cur("EUR"), &kraken()), Decimal::ZERO);

        let events = e
            .process_trade(&Trade::swap(day(1), "Kraken", btc(dec!(0.5)), eur(dec!(600))))
            .unwrap()
            .to_vec();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].gain, dec!(100));
        assert!(e.state().queues().next().is_none());
    }

    #[test]
    fn test_fee_in_external_leg_currency_is_not_tracked() {
        let mut e = engine();
        e.process_trade(
            &Trade::purchase(day(0), "Bitstamp", btc(dec!(1)), Money::new(dec!(1000), "USD"))
                .with_fee(Money::new(dec!(5), "USD")),
        )
        .unwrap();
        let lot = e
            .state()
            .queue(&LotKey::new("BTC", "Bitstamp"))
            .unwrap()
            .oldest()
            .unwrap()
            .clone();
        assert_eq!(lot.cost(), dec!(804));
        assert!(e.events().is_empty());
    }

    #[test]
    fn test_untagged_deposit_and_withdrawal() {
        let mut e = engine();
        e.process_trade(&Trade::deposit(day(0), "Kraken", btc(dec!(2))))
            .unwrap();
        let events = e
            .process_trade(
                &Trade::withdrawal(day(3), "Kraken", btc(dec!(1)))
                    .with_fee(btc(dec!(0.001))),
            )
            .unwrap()
            .to_vec();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, DisposalKind::Withdrawal);
        assert_eq!(events[0].proceeds, dec!(1000));
        assert_eq!(events[0].gain, Decimal::ZERO);
        assert_eq!(events[1].kind, DisposalKind::WithdrawalFee);
        assert_eq!(events[1].proceeds, dec!(1));
        assert_eq!(events[1].gain, Decimal::ZERO);
        assert_eq!(events[1].rate, dec!(1000));
        assert_eq!(e.balance(&cur("BTC"), &kraken()), dec!(0.999));
    }

    #[test]
    fn test_withdrawal_fee_is_sold_at_market_rate() {
        let mut e = engine();
        e.process_trade(&Trade::purchase(day(0), "Kraken", btc(dec!(1)), eur(dec!(700))))
            .unwrap();
        let events = e
            .process_trade(
                &Trade::withdrawal(day(5), "Kraken", btc(dec!(0.5)))
                    .with_transfer("t1")
                    .with_fee(btc(dec!(0.01))),
            )
            .unwrap()
            .to_vec();

        assert_eq!(events.len(), 1);
        let fee = &events[0];
        assert_eq!(fee.kind, DisposalKind::WithdrawalFee);
        assert_eq!(fee.amount, dec!(0.01));
        assert_eq!(fee.rate, dec!(1000));
        assert_eq!(fee.cost, dec!(7));
        assert_eq!(fee.proceeds, dec!(10));
        assert_eq!(fee.gain, dec!(3));
        assert_eq!(e.balance(&cur("BTC"), &kraken()), dec!(0.49));
    }

    #[test]
    fn test_tagged_transfer_keeps_basis_and_date() {
        let mut e = engine();
        e.process_trade(&Trade::purchase(day(0), "Kraken", btc(dec!(1)), eur(dec!(700))))
            .unwrap();
        e.process_trade(&Trade::withdrawal(day(10), "Kraken", btc(dec!(1))).with_transfer("t1"))
            .unwrap();
        assert!(e.events().is_empty());
        assert_eq!(e.state().in_transit("t1").unwrap().len(), 1);

        let events = e
            .process_trade(&Trade::deposit(day(11), "Wallet", btc(dec!(0.999))).with_transfer("t1"))
            .unwrap()
            .to_vec();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DisposalKind::DepositFee);
        assert_eq!(events[0].amount, dec!(0.001));
        assert_eq!(events[0].cost, dec!(0.7));
        assert_eq!(events[0].proceeds, dec!(1));
        assert_eq!(events[0].gain, dec!(0.3));

        let lot = e
            .state()
            .queue(&LotKey::new("BTC", "Wallet"))
            .unwrap()
            .oldest()
            .unwrap()
            .clone();
        assert_eq!(lot.amount(), dec!(0.999));
        assert_eq!(lot.unit_cost(), dec!(700));
        assert_eq!(lot.acquired_at(), day(0));
        assert!(e.state().in_transit("t1").is_none());
    }

    #[test]
    fn test_transfer_excess_or_unknown_tag_fails() {
        let mut e = engine();
        e.process_trade(&Trade::deposit(day(0), "Kraken", btc(dec!(1))))
            .unwrap();
        e.process_trade(&Trade::withdrawal(day(1), "Kraken", btc(dec!(1))).with_transfer("t1"))
            .unwrap();

        let err = e
            .process_trade(&Trade::deposit(day(2), "Wallet", btc(dec!(1.5))).with_transfer("t1"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransferMismatch { .. }));
        // the failed deposit left the transfer in place
        assert!(e.state().in_transit("t1").is_some());

        let err = e
            .process_trade(&Trade::deposit(day(2), "Wallet", btc(dec!(1))).with_transfer("nope"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransferMismatch { .. }));
    }

    #[test]
    fn test_insufficient_funds_leaves_state_untouched() {
        let mut e = engine();
        e.process_trade(&Trade::purchase(day(0), "Kraken", btc(dec!(1)), eur(dec!(1000))))
            .unwrap();
        let before = e.state().clone();

        let err = e
            .process_trade(
                &Trade::sale(day(1), "Kraken", btc(dec!(1)), eur(dec!(1100)))
                    .with_fee(btc(dec!(0.01))),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Lot(LotError::InsufficientFunds { .. })));
        assert_eq!(e.state(), &before);
        assert!(e.events().is_empty());
    }

    #[test]
    fn test_out_of_order_trade_rejected() {
        let mut e = engine();
        e.process_trade(&Trade::deposit(day(5), "Kraken", btc(dec!(1))))
            .unwrap();
        let err = e
            .process_trade(&Trade::deposit(day(4), "Kraken", btc(dec!(1))))
            .unwrap_err();
        assert!(matches!(err, LedgerError::OutOfOrderTrade { .. }));
    }

    #[test]
    fn test_unrelated_currency_aborts() {
        let mut e = engine();
        let err = e
            .process_trade(&Trade::deposit(day(0), "Kraken", Money::new(dec!(1), "DOGE")))
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rate(RateError::UnrelatedCurrencies { .. })
        ));
        assert!(e.state().last_trade_at().is_none());
    }

    #[test]
    fn test_pending_skips_processed_trades_at_same_instant() {
        let trades = vec![
            Trade::deposit(day(0), "Kraken", btc(dec!(1))),
            Trade::deposit(day(1), "Kraken", btc(dec!(1))),
            Trade::deposit(day(1), "Kraken", btc(dec!(2))),
            Trade::deposit(day(2), "Kraken", btc(dec!(3))),
        ];
        let mut e = engine();
        e.process_all(&trades[..2]).unwrap();
        let pending = e.pending(&trades);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id(), trades[2].id());

        e.process_all(pending).unwrap();
        assert!(e.pending(&trades).is_empty());
        assert_eq!(e.balance(&cur("BTC"), &kraken()), dec!(7));
    }

    #[test]
    fn test_store_sees_state_before_each_trade() {
        let mut e = engine().with_store(Box::new(MemoryStore::new()));
        e.process_all(&[
            Trade::deposit(day(0), "Kraken", btc(dec!(1))),
            Trade::deposit(day(1), "Kraken", btc(dec!(1))),
        ])
        .unwrap();
        assert_eq!(e.balance(&cur("BTC"), &kraken()), dec!(2));
    }

    #[test]
    fn test_holding_period_in_days() {
        let config = EngineConfig::default().with_holding_period(HoldingPeriod::Days(10));
        let rates = RateGraph::from_series(vec![flat("BTC", "EUR", dec!(1000))], Duration::days(365));
        let mut e = LedgerEngine::new(config, rates);
        e.process_trade(&Trade::deposit(day(0), "Kraken", btc(dec!(2))))
            .unwrap();
        e.process_trade(&Trade::sale(day(9), "Kraken", btc(dec!(1)), eur(dec!(1000))))
            .unwrap();
        e.process_trade(&Trade::sale(day(10), "Kraken", btc(dec!(1)), eur(dec!(1000))))
            .unwrap();
        let flags: Vec<bool> = e.events().iter().map(|ev| ev.long_term).collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_resume_requires_same_home_currency() {
        let state = EngineState::new("USD");
        let result = LedgerEngine::with_state(EngineConfig::default(), RateGraph::default(), state);
        assert!(matches!(result, Err(LedgerError::HomeCurrencyMismatch { .. })));
    }
}
