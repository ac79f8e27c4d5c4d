//! Synthetic trade histories for benchmarks and stress tests.

pub mod trade_generator;
