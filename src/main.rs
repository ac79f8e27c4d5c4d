//! ccgains CLI
//!
//! Compute FIFO capital gains from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Process a trade history and print the gains report
//! ccgains process --trades trades.json --rates rates.json
//!
//! # Only report 2017, continuing from last year's state, and save the new state
//! ccgains process --trades trades.json --rates rates.json \
//!     --state state-2016.json --year 2017 --save state-2017.json
//!
//! # Show what a saved state holds
//! ccgains holdings --state state-2017.json
//!
//! # Look up a historical rate
//! ccgains rate --rates rates.json --from XMR --to EUR --at 2017-06-01T12:00:00Z
//! ```

use ccgains::core::currency::{CurrencyCode, CurrencyPair};
use ccgains::core::trade::TradeHistory;
use ccgains::ledger::config::EngineConfig;
use ccgains::ledger::engine::LedgerEngine;
use ccgains::ledger::report::GainsReport;
use ccgains::ledger::state::{EngineState, JsonFileStore};
use ccgains::rates::graph::RateGraph;
use ccgains::rates::series::RateSeries;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::fs;
use std::process;

fn print_usage() {
    eprintln!(
        r#"ccgains: FIFO capital gains for cryptocurrency and fiat trades

USAGE:
    ccgains <COMMAND> [OPTIONS]

COMMANDS:
    process     Process trades and report realized gains
    holdings    Show the lots held in a saved state
    rate        Resolve an exchange rate at a given time
    help        Show this message

OPTIONS (process):
    --trades <FILE>     Path to JSON trades file
    --rates <FILE>      Path to JSON rates file
    --config <FILE>     Engine configuration (JSON)
    --home <CUR>        Home currency (overrides the config)
    --state <FILE>      Resume from a saved state
    --save <FILE>       Write the final state here
    --snapshot <FILE>   Keep a crash-recovery snapshot here while processing
    --year <YYYY>       Only report disposals in this year
    --format <FORMAT>   Output format: text (default) or json

OPTIONS (holdings):
    --state <FILE>      Saved state
    --home <CUR>        Home currency of the state (default: EUR)
    --format <FORMAT>   Output format: text (default) or json

OPTIONS (rate):
    --rates <FILE>      Path to JSON rates file
    --from <CUR>        Currency to convert from
    --to <CUR>          Currency to convert to
    --at <TIME>         RFC 3339 timestamp

EXAMPLES:
    ccgains process --trades trades.json --rates rates.json --year 2017
    ccgains process --trades trades.json --rates rates.json --save state.json --format json
    ccgains holdings --state state.json
    ccgains rate --rates rates.json --from BTC --to EUR --at 2017-12-17T00:00:00Z"#
    );
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

/// JSON schema for rate input.
#[derive(serde::Deserialize)]
struct RatesFile {
    series: Vec<SeriesInput>,
}

#[derive(serde::Deserialize)]
struct SeriesInput {
    pair: String,
    samples: Vec<SampleInput>,
}

#[derive(serde::Deserialize)]
struct SampleInput {
    time: DateTime<Utc>,
    rate: Decimal,
}

/// JSON output schema for a gains report.
#[derive(serde::Serialize)]
struct ReportOutput {
    home_currency: String,
    year: Option<i32>,
    disposals: usize,
    proceeds: String,
    cost: String,
    short_term_gain: String,
    long_term_gain: String,
    fee_gain: String,
    total_gain: String,
    rows: Vec<ccgains::ledger::report::ReportRow>,
}

#[derive(serde::Serialize)]
struct HoldingOutput {
    currency: String,
    exchange: String,
    amount: String,
    cost: String,
    lots: usize,
}

fn load_rates(path: &str, tolerance: Duration) -> RateGraph {
    let content = fs::read_to_string(path).unwrap_or_else(|e| {
        fail(format!("reading rates file '{}': {}", path, e));
    });
    let file: RatesFile = serde_json::from_str(&content).unwrap_or_else(|e| {
        eprintln!("Error parsing rates JSON: {}", e);
        eprintln!("Expected format:");
        eprintln!(
            r#"{{
  "series": [
    {{ "pair": "BTC/EUR", "samples": [ {{ "time": "2017-01-01T00:00:00Z", "rate": "920.5" }} ] }}
  ]
}}"#
        );
        process::exit(1);
    });

    let mut graph = RateGraph::new(tolerance);
    for input in file.series {
        let pair: CurrencyPair = input.pair.parse().unwrap_or_else(|e| fail(e));
        let samples = input.samples.into_iter().map(|s| (s.time, s.rate));
        let series = RateSeries::with_samples(pair, samples).unwrap_or_else(|e| fail(e));
        graph.add_series(series);
    }
    graph
}

fn load_trades(path: &str) -> TradeHistory {
    let content = fs::read_to_string(path).unwrap_or_else(|e| {
        fail(format!("reading trades file '{}': {}", path, e));
    });
    let mut history: TradeHistory = serde_json::from_str(&content).unwrap_or_else(|e| {
        eprintln!("Error parsing trades JSON: {}", e);
        eprintln!("Expected format:");
        eprintln!(
            r#"{{
  "trades": [
    {{ "kind": "Purchase", "time": "2017-01-01T12:00:00Z", "exchange": "Kraken",
      "primary": {{ "currency": "BTC", "amount": "1.0" }},
      "secondary": {{ "currency": "EUR", "amount": "1000" }},
      "fees": [ {{ "currency": "EUR", "amount": "10" }} ] }}
  ]
}}"#
        );
        process::exit(1);
    });
    history.sort();
    history
}

/// Pull the value following a flag.
fn flag_value(args: &[String], i: usize, flag: &str, what: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("{} requires {}", flag, what);
        process::exit(1);
    })
}

fn cmd_process(args: &[String]) {
    let mut trades_path = None;
    let mut rates_path = None;
    let mut config_path = None;
    let mut home = None;
    let mut state_path = None;
    let mut save_path = None;
    let mut snapshot_path = None;
    let mut year: Option<i32> = None;
    let mut format = "text".to_string();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        match flag {
            "--trades" => trades_path = Some(flag_value(args, i, flag, "a file path")),
            "--rates" => rates_path = Some(flag_value(args, i, flag, "a file path")),
            "--config" => config_path = Some(flag_value(args, i, flag, "a file path")),
            "--home" => home = Some(flag_value(args, i, flag, "a currency code")),
            "--state" => state_path = Some(flag_value(args, i, flag, "a file path")),
            "--save" => save_path = Some(flag_value(args, i, flag, "a file path")),
            "--snapshot" => snapshot_path = Some(flag_value(args, i, flag, "a file path")),
            "--year" => {
                year = Some(
                    flag_value(args, i, flag, "a year")
                        .parse()
                        .unwrap_or_else(|_| fail("--year requires a number")),
                )
            }
            "--format" => format = flag_value(args, i, flag, "'text' or 'json'"),
            _ => {
                eprintln!("Unknown option: {}", flag);
                process::exit(1);
            }
        }
        i += 1;
    }

    let trades_path = trades_path.unwrap_or_else(|| fail("--trades <FILE> is required"));
    let rates_path = rates_path.unwrap_or_else(|| fail("--rates <FILE> is required"));

    let mut config = match config_path {
        Some(path) => EngineConfig::load(&path).unwrap_or_else(|e| fail(e)),
        None => EngineConfig::default(),
    };
    if let Some(home) = home {
        config.home_currency = CurrencyCode::new(home);
    }

    let history = load_trades(&trades_path);
    let rates = load_rates(&rates_path, config.rate_tolerance());
    let home = config.home_currency.clone();

    let mut engine = match state_path {
        Some(path) => {
            let state = JsonFileStore::new(&path)
                .load(&home)
                .unwrap_or_else(|e| fail(e));
            LedgerEngine::with_state(config, rates, state).unwrap_or_else(|e| fail(e))
        }
        None => LedgerEngine::new(config, rates),
    };
    if let Some(path) = snapshot_path {
        engine = engine.with_store(Box::new(JsonFileStore::new(path)));
    }

    let pending = engine.pending(history.trades());
    if pending.len() < history.len() {
        eprintln!(
            "Skipping {} trades already reflected in the state",
            history.len() - pending.len()
        );
    }
    engine.process_all(pending).unwrap_or_else(|e| fail(e));

    let report = match year {
        Some(year) => GainsReport::for_year(engine.events(), year, home.clone()),
        None => GainsReport::new(engine.events().to_vec(), home.clone()),
    };

    if format == "json" {
        let output = ReportOutput {
            home_currency: home.to_string(),
            year: report.year(),
            disposals: report.len(),
            proceeds: report.total_proceeds().to_string(),
            cost: report.total_cost().to_string(),
            short_term_gain: report.short_term_gain().to_string(),
            long_term_gain: report.long_term_gain().to_string(),
            fee_gain: report.fee_gain().to_string(),
            total_gain: report.total_gain().to_string(),
            rows: report.extended_rows(),
        };
        let json = serde_json::to_string_pretty(&output).unwrap_or_else(|e| fail(e));
        println!("{}", json);
    } else {
        println!("{}", report);
        print_holdings(engine.state());
    }

    if let Some(path) = save_path {
        let json = engine.state().to_json().unwrap_or_else(|e| fail(e));
        fs::write(&path, json).unwrap_or_else(|e| {
            fail(format!("writing state to '{}': {}", path, e));
        });
        eprintln!("State saved to {}", path);
    }
}

fn print_holdings(state: &EngineState) {
    println!("=== Holdings ===");
    let mut any = false;
    for queue in state.queues() {
        any = true;
        println!(
            "  {:<8} {:<12} {} (cost {} {}, {} lots)",
            queue.key().currency.to_string(),
            queue.key().exchange.to_string(),
            queue.total(),
            queue.total_cost(),
            state.home_currency(),
            queue.len()
        );
    }
    for (tag, lots) in state.transfers_in_transit() {
        any = true;
        let amount: Decimal = lots.iter().map(|l| l.amount()).sum();
        let currency = lots
            .first()
            .map(|l| l.currency().to_string())
            .unwrap_or_default();
        println!("  in transit '{}': {} {}", tag, amount, currency);
    }
    if !any {
        println!("  (nothing held)");
    }
}

fn cmd_holdings(args: &[String]) {
    let mut state_path = None;
    let mut home = "EUR".to_string();
    let mut format = "text".to_string();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        match flag {
            "--state" => state_path = Some(flag_value(args, i, flag, "a file path")),
            "--home" => home = flag_value(args, i, flag, "a currency code"),
            "--format" => format = flag_value(args, i, flag, "'text' or 'json'"),
            _ => {
                eprintln!("Unknown option: {}", flag);
                process::exit(1);
            }
        }
        i += 1;
    }

    let path = state_path.unwrap_or_else(|| fail("--state <FILE> is required"));
    let state = JsonFileStore::new(&path)
        .load(&CurrencyCode::new(home))
        .unwrap_or_else(|e| fail(e));

    if format == "json" {
        let holdings: Vec<HoldingOutput> = state
            .queues()
            .map(|q| HoldingOutput {
                currency: q.key().currency.to_string(),
                exchange: q.key().exchange.to_string(),
                amount: q.total().to_string(),
                cost: q.total_cost().to_string(),
                lots: q.len(),
            })
            .collect();
        let json = serde_json::to_string_pretty(&holdings).unwrap_or_else(|e| fail(e));
        println!("{}", json);
    } else {
        if let Some(last) = state.last_trade_at() {
            println!("Last trade: {}", last.to_rfc3339());
        }
        print_holdings(&state);
    }
}

fn cmd_rate(args: &[String]) {
    let mut rates_path = None;
    let mut from = None;
    let mut to = None;
    let mut at = None;
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        match flag {
            "--rates" => rates_path = Some(flag_value(args, i, flag, "a file path")),
            "--from" => from = Some(flag_value(args, i, flag, "a currency code")),
            "--to" => to = Some(flag_value(args, i, flag, "a currency code")),
            "--at" => at = Some(flag_value(args, i, flag, "an RFC 3339 timestamp")),
            _ => {
                eprintln!("Unknown option: {}", flag);
                process::exit(1);
            }
        }
        i += 1;
    }

    let rates_path = rates_path.unwrap_or_else(|| fail("--rates <FILE> is required"));
    let from = CurrencyCode::new(from.unwrap_or_else(|| fail("--from <CUR> is required")));
    let to = CurrencyCode::new(to.unwrap_or_else(|| fail("--to <CUR> is required")));
    let at = at.unwrap_or_else(|| fail("--at <TIME> is required"));
    let at: DateTime<Utc> = DateTime::parse_from_rfc3339(&at)
        .unwrap_or_else(|e| fail(format!("invalid time '{}': {}", at, e)))
        .with_timezone(&Utc);

    let mut graph = load_rates(&rates_path, EngineConfig::default().rate_tolerance());
    let rate = graph.rate(&from, &to, at).unwrap_or_else(|e| fail(e));
    println!("1 {} = {} {} at {}", from, rate, to, at.to_rfc3339());
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let command = args[1].as_str();
    let rest = &args[2..];

    match command {
        "process" => cmd_process(rest),
        "holdings" => cmd_holdings(rest),
        "rate" => cmd_rate(rest),
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            process::exit(1);
        }
    }
}
