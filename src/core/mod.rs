//! Foundational types: currencies, exchanges, trades and lots.

pub mod currency;
pub mod exchange;
pub mod lot;
pub mod trade;
