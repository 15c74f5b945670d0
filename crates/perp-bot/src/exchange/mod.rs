//! Exchange abstraction for live, simulated, and backtest trading.
//!
//! The `Exchange` trait is the only surface the control loop sees. The same
//! decision pipeline drives:
//! - `BinanceExchange`: real USDT-margined perpetual futures
//! - `SimulatedExchange`: in-memory fills over a placeholder price drift
//! - `BacktestExchange`: historical 3m klines replayed from CSV
//!
//! ## Decision flow
//!
//! 1. The loop calls `refresh_market_data()` once per cycle
//! 2. Account/position/market snapshots feed the context builder
//! 3. Validated decisions are executed one at a time via
//!    `execute_decision()`; each adaptor maps the action tag onto its own
//!    order plumbing
//!
//! The exchange is authoritative for positions: the loop never assumes an
//! order succeeded, it re-reads state next cycle.

pub mod backtest;
pub mod binance;
pub mod oi_tracker;
pub mod open_time;
pub mod paper;
pub mod simulated;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use perp_common::Side;

use crate::types::{Account, Decision, MarketSnapshot, Position, TradeRecord};

/// Binance error code for "stop order type not supported on this account".
pub const STOP_ORDER_UNSUPPORTED_CODE: i64 = -4120;

/// Errors surfaced by an exchange adaptor.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The backtest series is exhausted; the loop must stop cleanly.
    #[error("backtest finished")]
    BacktestFinished,

    #[error("no market data for {0}")]
    NoMarketData(String),

    #[error("invalid market price for {0}")]
    InvalidPrice(String),

    #[error("insufficient balance: have {available:.2}, need {required:.2}")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("conflict: existing {existing} position for {symbol}")]
    PositionConflict { symbol: String, existing: Side },

    #[error("no matching position for {action} on {symbol}")]
    NoPosition { symbol: String, action: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("exchange API error (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("exchange transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange response parse error: {0}")]
    Parse(String),

    #[error("{0} is not supported by this exchange")]
    Unsupported(&'static str),
}

impl ExchangeError {
    /// True for the latched "stop order unsupported" condition.
    pub fn is_stop_order_unsupported(&self) -> bool {
        matches!(self, ExchangeError::Api { code, .. } if *code == STOP_ORDER_UNSUPPORTED_CODE)
    }
}

/// Uniform surface over the three exchange variants.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Populate or update per-symbol snapshots and re-value the account at
    /// the new marks. Fatal input errors only; per-symbol fetch failures
    /// are logged and skipped.
    async fn refresh_market_data(&self, symbols: &[String]) -> Result<(), ExchangeError>;

    /// Snapshot of the account.
    async fn account(&self) -> Account;

    /// Snapshot list of open positions.
    async fn positions(&self) -> Vec<Position>;

    /// Snapshot of the per-symbol market data map.
    async fn market_data(&self) -> BTreeMap<String, MarketSnapshot>;

    /// Execute one validated decision.
    async fn execute_decision(&self, decision: &Decision) -> Result<(), ExchangeError>;

    /// Recent trade records, newest first.
    async fn trade_history(&self) -> Vec<TradeRecord>;

    /// Change the leverage for a symbol. Only meaningful on the live
    /// exchange.
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Err(ExchangeError::Unsupported("set_leverage"))
    }

    /// Cancel leftover protective orders for symbols with no position.
    /// Live-only housekeeping; a no-op elsewhere.
    async fn cleanup_protective_orders(&self, _symbols: &[String]) {}

    /// Short adaptor name for logs.
    fn name(&self) -> &'static str;
}
