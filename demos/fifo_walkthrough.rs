//! Walk through a short trade history and print every realized gain.
//!
//! Run with `RUST_LOG=debug cargo run --example fifo_walkthrough` to see
//! the engine's lot bookkeeping as it goes.

use ccgains::prelude::*;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal_macros::dec;

fn main() -> Result<(), LedgerError> {
    env_logger::init();

    let day0 = Utc
        .with_ymd_and_hms(2017, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let day = |n: i64| day0 + Duration::days(n);

    let mut btc = RateSeries::new(CurrencyPair::new("BTC", "EUR"));
    btc.extend([(day(0), dec!(1000)), (day(200), dec!(1150)), (day(400), dec!(1250))])?;
    let rates = RateGraph::from_series([btc], Duration::hours(24));

    let trades = vec![
        Trade::purchase(
            day(0),
            "Kraken",
            Money::new(dec!(1.0), "BTC"),
            Money::new(dec!(1000), "EUR"),
        )
        .with_fee(Money::new(dec!(10), "EUR")),
        Trade::purchase(
            day(200),
            "Kraken",
            Money::new(dec!(0.5), "BTC"),
            Money::new(dec!(575), "EUR"),
        ),
        Trade::sale(
            day(400),
            "Kraken",
            Money::new(dec!(0.4), "BTC"),
            Money::new(dec!(500), "EUR"),
        ),
        Trade::sale(
            day(401),
            "Kraken",
            Money::new(dec!(0.8), "BTC"),
            Money::new(dec!(1000), "EUR"),
        ),
    ];

    let mut engine = LedgerEngine::new(EngineConfig::new("EUR"), rates);
    for trade in &trades {
        println!("{}", trade);
        for event in engine.process_trade(trade)? {
            println!("  -> {}", event);
        }
    }

    println!("\nRemaining lots:");
    for queue in engine.state().queues() {
        for lot in queue.lots() {
            println!("  {}", lot);
        }
    }

    let report = GainsReport::new(engine.events().to_vec(), "EUR");
    println!("\n{}", report);
    Ok(())
}
