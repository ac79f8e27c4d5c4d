//! Historical exchange rates: per-pair series and the currency graph
//! that composes them into arbitrary conversions.

pub mod graph;
pub mod series;
