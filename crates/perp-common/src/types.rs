//! Shared primitive types for the trading agent.

use serde::{Deserialize, Serialize};

/// Direction of a perpetual-futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// The opposite side, used when mapping a close to an order direction.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// One OHLCV bar. `taker_buy_volume` is only populated by sources that
/// report it (live klines and backtest CSVs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Close time in epoch milliseconds.
    pub close_time: i64,
    #[serde(default)]
    pub taker_buy_volume: f64,
}

/// Returns true for the "major" symbols (BTC and ETH perpetuals), which get
/// wider risk limits and stop thresholds than altcoins.
pub fn is_major(symbol: &str) -> bool {
    symbol.contains("BTC") || symbol.contains("ETH")
}

/// Quantity precision (decimal places) accepted by the exchange for a
/// symbol's order quantity. Wrong precision is rejected by the exchange,
/// so the table errs on the strict side.
pub fn quantity_precision(symbol: &str) -> usize {
    if symbol.contains("SOL") {
        1
    } else if symbol.contains("DOGE") {
        0
    } else if symbol.contains("BNB") {
        2
    } else {
        3
    }
}

/// Format an order quantity with the symbol's accepted precision.
pub fn format_quantity(symbol: &str, quantity: f64) -> String {
    format!("{:.*}", quantity_precision(symbol), quantity)
}

/// Format a trigger/limit price. Four decimals is accepted across the
/// configured basket.
pub fn format_price(price: f64) -> String {
    format!("{price:.4}")
}
