//! FIFO lot accounting: the engine, its configuration, persisted state
//! and the disposal events it realizes.

pub mod config;
pub mod disposal;
pub mod engine;
pub mod report;
pub mod state;
