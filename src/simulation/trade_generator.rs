//! Random but consistent trade histories.
//!
//! Every generated history can be processed from an empty state: no
//! disposal ever exceeds what the simulated account holds, transfers are
//! matched, and a rate series to the home currency is generated for each
//! asset covering the whole period.

use crate::core::currency::{CurrencyCode, CurrencyPair};
use crate::core::exchange::ExchangeId;
use crate::core::trade::{Money, Trade};
use crate::rates::graph::RateGraph;
use crate::rates::series::{RateError, RateSeries};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Configuration for generating a random trade history.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub home_currency: CurrencyCode,
    /// Assets traded, with their starting price in the home currency.
    pub assets: Vec<(CurrencyCode, Decimal)>,
    pub exchanges: Vec<ExchangeId>,
    /// Number of generated actions. Transfers produce two trades.
    pub trade_count: usize,
    pub start: DateTime<Utc>,
    /// Time between consecutive actions. The deposit half of a transfer
    /// lands halfway to the next action.
    pub spacing: Duration,
    /// Fix the random sequence; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            home_currency: CurrencyCode::new("EUR"),
            assets: vec![
                (CurrencyCode::new("BTC"), Decimal::from(1_000)),
                (CurrencyCode::new("ETH"), Decimal::from(10)),
                (CurrencyCode::new("XMR"), Decimal::from(12)),
            ],
            exchanges: vec![ExchangeId::new("Kraken"), ExchangeId::new("Poloniex")],
            trade_count: 100,
            start: Utc
                .with_ymd_and_hms(2016, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
            spacing: Duration::hours(12),
            seed: None,
        }
    }
}

/// A generated history together with the prices it was generated from.
#[derive(Debug, Clone)]
pub struct GeneratedHistory {
    pub trades: Vec<Trade>,
    /// Daily samples per `ASSET/HOME` pair.
    pub prices: Vec<(CurrencyPair, Vec<(DateTime<Utc>, Decimal)>)>,
}

impl GeneratedHistory {
    /// A fresh rate graph over the generated prices.
    pub fn rate_graph(&self) -> Result<RateGraph, RateError> {
        let mut graph = RateGraph::default();
        for (pair, samples) in &self.prices {
            graph.add_series(RateSeries::with_samples(pair.clone(), samples.clone())?);
        }
        Ok(graph)
    }
}

struct Market {
    days: Vec<DateTime<Utc>>,
    /// asset -> price per day
    prices: HashMap<CurrencyCode, Vec<Decimal>>,
    start: DateTime<Utc>,
}

impl Market {
    fn price(&self, asset: &CurrencyCode, time: DateTime<Utc>) -> Decimal {
        let day = (time - self.start).num_days().max(0) as usize;
        self.prices
            .get(asset)
            .and_then(|p| p.get(day.min(p.len().saturating_sub(1))))
            .copied()
            .unwrap_or(Decimal::ONE)
    }
}

fn random_walk(rng: &mut StdRng, config: &HistoryConfig, days: usize) -> Market {
    let min_price = Decimal::new(1, 2);
    let mut prices = HashMap::new();
    for (asset, start_price) in &config.assets {
        let mut price = *start_price;
        let mut series = Vec::with_capacity(days);
        for _ in 0..days {
            series.push(price);
            // daily move between -5% and +5%
            let change = Decimal::new(rng.gen_range(95..=105), 2);
            price = (price * change).round_dp(2).max(min_price);
        }
        prices.insert(asset.clone(), series);
    }
    Market {
        days: (0..days)
            .map(|d| config.start + Duration::days(d as i64))
            .collect(),
        prices,
        start: config.start,
    }
}

/// Random amount between 0.0001 and 1 times `scale`.
fn random_amount(rng: &mut StdRng, scale: Decimal) -> Decimal {
    (Decimal::new(rng.gen_range(1..=10_000), 4) * scale).round_dp(8)
}

/// Random share (1% to 100%) of `balance`, never zero.
fn random_share(rng: &mut StdRng, balance: Decimal) -> Decimal {
    let share = (balance * Decimal::new(rng.gen_range(1..=100), 2)).round_dp(8);
    if share <= Decimal::ZERO || share > balance {
        balance
    } else {
        share
    }
}

/// Generate a random, internally consistent trade history.
pub fn generate_history(config: &HistoryConfig) -> GeneratedHistory {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let span = config.spacing * (config.trade_count as i32 + 1);
    let days = span.num_days().max(0) as usize + 2;
    let market = random_walk(&mut rng, config, days);

    let mut balances: HashMap<(CurrencyCode, ExchangeId), Decimal> = HashMap::new();
    let mut trades = Vec::with_capacity(config.trade_count);
    let home = &config.home_currency;

    if config.assets.is_empty() || config.exchanges.is_empty() {
        return GeneratedHistory {
            trades,
            prices: Vec::new(),
        };
    }

    for i in 0..config.trade_count {
        let time = config.start + config.spacing * i as i32;
        let (asset, _) = &config.assets[rng.gen_range(0..config.assets.len())];
        let exchange = &config.exchanges[rng.gen_range(0..config.exchanges.len())];
        let price = market.price(asset, time);
        let key = (asset.clone(), exchange.clone());
        let held = balances.get(&key).copied().unwrap_or(Decimal::ZERO);

        let action = if held == Decimal::ZERO { 0 } else { rng.gen_range(0..5) };
        match action {
            // buy with home currency, paying a home-currency fee
            0 => {
                let amount = random_amount(&mut rng, Decimal::from(10));
                let cost = (amount * price).round_dp(2).max(Decimal::new(1, 2));
                let fee = (cost * Decimal::new(2, 3)).round_dp(2);
                trades.push(
                    Trade::purchase(
                        time,
                        exchange.clone(),
                        Money::new(amount, asset.clone()),
                        Money::new(cost, home.clone()),
                    )
                    .with_fee(Money::new(fee, home.clone())),
                );
                *balances.entry(key).or_insert(Decimal::ZERO) += amount;
            }
            // sell for home currency
            1 => {
                let amount = random_share(&mut rng, held);
                let proceeds = (amount * price).round_dp(2);
                trades.push(Trade::sale(
                    time,
                    exchange.clone(),
                    Money::new(amount, asset.clone()),
                    Money::new(proceeds, home.clone()),
                ));
                balances.insert(key, held - amount);
            }
            // swap into another asset on the same exchange
            2 if config.assets.len() > 1 => {
                let (target, _) = config
                    .assets
                    .iter()
                    .filter(|(a, _)| a != asset)
                    .nth(rng.gen_range(0..config.assets.len() - 1))
                    .unwrap_or(&config.assets[0]);
                let amount = random_share(&mut rng, held);
                let target_price = market.price(target, time);
                let received = (amount * price / target_price).round_dp(8);
                if received <= Decimal::ZERO || target == asset {
                    continue;
                }
                trades.push(Trade::swap(
                    time,
                    exchange.clone(),
                    Money::new(amount, asset.clone()),
                    Money::new(received, target.clone()),
                ));
                balances.insert(key, held - amount);
                *balances
                    .entry((target.clone(), exchange.clone()))
                    .or_insert(Decimal::ZERO) += received;
            }
            // move to another exchange, losing a little on the way
            3 if config.exchanges.len() > 1 => {
                let to = config
                    .exchanges
                    .iter()
                    .filter(|e| *e != exchange)
                    .nth(rng.gen_range(0..config.exchanges.len() - 1))
                    .unwrap_or(&config.exchanges[0]);
                let amount = random_share(&mut rng, held);
                let lost = (amount * Decimal::new(1, 3)).round_dp(8);
                let tag = format!("transfer-{}", i);
                trades.push(
                    Trade::withdrawal(time, exchange.clone(), Money::new(amount, asset.clone()))
                        .with_transfer(tag.clone()),
                );
                trades.push(
                    Trade::deposit(
                        time + config.spacing / 2,
                        to.clone(),
                        Money::new(amount - lost, asset.clone()),
                    )
                    .with_transfer(tag),
                );
                balances.insert(key, held - amount);
                *balances
                    .entry((asset.clone(), to.clone()))
                    .or_insert(Decimal::ZERO) += amount - lost;
            }
            // withdraw out of the ledger, paying a fee in kind
            _ => {
                let amount = random_share(&mut rng, held);
                let fee = (amount * Decimal::new(5, 4)).round_dp(8);
                if amount + fee > held || fee == Decimal::ZERO {
                    continue;
                }
                trades.push(
                    Trade::withdrawal(time, exchange.clone(), Money::new(amount, asset.clone()))
                        .with_fee(Money::new(fee, asset.clone())),
                );
                balances.insert(key, held - amount - fee);
            }
        }
    }

    let prices = config
        .assets
        .iter()
        .map(|(asset, _)| {
            let samples = market
                .days
                .iter()
                .map(|day| (*day, market.price(asset, *day)))
                .collect();
            (CurrencyPair::new(asset.clone(), home.clone()), samples)
        })
        .collect();

    GeneratedHistory { trades, prices }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::config::EngineConfig;
    use crate::ledger::engine::LedgerEngine;

    #[test]
    fn test_history_generation_is_seeded() {
        let config = HistoryConfig {
            trade_count: 40,
            seed: Some(7),
            ..Default::default()
        };
        let a = generate_history(&config);
        let b = generate_history(&config);
        assert!(!a.trades.is_empty());
        assert_eq!(a.trades.len(), b.trades.len());
        assert_eq!(a.prices, b.prices);
        assert!(a.trades.windows(2).all(|w| w[0].time() <= w[1].time()));
    }

    #[test]
    fn test_generated_history_processes_cleanly() {
        let config = HistoryConfig {
            trade_count: 200,
            seed: Some(42),
            ..Default::default()
        };
        let history = generate_history(&config);
        let mut engine =
            LedgerEngine::new(EngineConfig::default(), history.rate_graph().unwrap());
        engine.process_all(&history.trades).unwrap();
        assert!(engine.pending(&history.trades).is_empty());
    }
}
