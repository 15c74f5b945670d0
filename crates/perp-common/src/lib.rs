//! Shared types for the perpetual-futures trading agent.
//!
//! This crate contains the primitives every other crate agrees on:
//! - Position side (`Side`)
//! - Raw OHLCV records (`Kline`)
//! - Symbol classification and order precision helpers

pub mod types;

pub use types::*;
