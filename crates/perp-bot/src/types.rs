//! Core data model for the trading agent.
//!
//! Everything the control loop passes between subsystems lives here: the
//! per-symbol market snapshot, account and position state, the advisor's
//! decision structures, and the per-cycle context handed to the advisor
//! and the dashboard.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use perp_common::Side;

// ============================================================================
// Market data
// ============================================================================

/// Indicator bundle for one derived timeframe (5m/15m/30m/1h).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeframeIndicators {
    pub ema20: f64,
    pub macd: f64,
    pub rsi14: f64,
    pub atr14: f64,
}

impl TimeframeIndicators {
    /// True when the underlying series was long enough to produce anything.
    pub fn is_populated(&self) -> bool {
        self.ema20 != 0.0 || self.macd != 0.0 || self.rsi14 != 0.0 || self.atr14 != 0.0
    }
}

/// Bollinger bands over the 3m closes (20-period SMA, 2 sigma).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Last ~10 samples of the 3m series, used for entry timing only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntradaySeries {
    pub mid_prices: Vec<f64>,
    pub ema20: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
    pub volume: Vec<f64>,
    /// ATR14 over the full 3m series.
    pub atr14: f64,
}

/// 4h context: slow EMAs, ATRs, volume, and short indicator tails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongerTermContext {
    pub ema20: f64,
    pub ema50: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub current_volume: f64,
    pub average_volume: f64,
    pub macd: Vec<f64>,
    pub rsi14: Vec<f64>,
}

/// Open interest with tracked changes. `change_1h`/`change_4h` come from the
/// local OI history, not the exchange.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenInterest {
    pub latest: f64,
    pub average: f64,
    pub change_1h: f64,
    pub change_4h: f64,
}

/// Top-trader long/short account ratio.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LongShortRatio {
    pub ratio: f64,
    pub long_pct: f64,
    pub short_pct: f64,
}

/// Local liquidation estimate. A heuristic derived from OI drawdown and
/// volatility; only populated when OI is falling meaningfully.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LiquidationEstimate {
    pub amount_1h: f64,
    pub amount_4h: f64,
    /// > 1 means longs are being liquidated more than shorts.
    pub side_ratio: f64,
}

/// Relative volume and taker flow over the 3m series.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolumeAnalysis {
    pub relative_volume_3m: f64,
    pub taker_buy_sell_ratio: f64,
    pub is_volume_spike: bool,
}

/// Local sentiment score built from funding rate and long/short crowding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sentiment {
    /// 0-100, 50 is neutral.
    pub fear_greed_index: i32,
    pub fear_greed_label: String,
    /// Crowding tag: "Bullish_Crowded", "Bearish_Crowded" or "Neutral".
    pub crowding: String,
    /// Short-term realized volatility (1h bars).
    pub volatility_1h: f64,
}

/// Everything the agent knows about one symbol at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_1h: f64,
    pub price_change_4h: f64,
    pub price_change_day: f64,

    // 3m snapshot indicators.
    pub current_ema20: f64,
    pub current_macd: f64,
    pub current_rsi7: f64,

    pub tf_5m: TimeframeIndicators,
    pub tf_15m: TimeframeIndicators,
    pub tf_30m: TimeframeIndicators,
    pub tf_1h: TimeframeIndicators,

    pub bollinger: Bollinger,

    pub funding_rate: f64,
    pub open_interest: Option<OpenInterest>,
    pub long_short_ratio: Option<LongShortRatio>,
    pub liquidation: Option<LiquidationEstimate>,
    pub volume: Option<VolumeAnalysis>,
    pub sentiment: Option<Sentiment>,

    pub intraday: Option<IntradaySeries>,
    pub longer_term: Option<LongerTermContext>,
}

// ============================================================================
// Account & positions
// ============================================================================

/// One open position. At most one per (symbol, side); long and short on the
/// same symbol coexist only in hedge mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Size-weighted average entry across additions.
    pub entry_price: f64,
    pub mark_price: f64,
    /// Quantity in coins, always positive.
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    /// Unrealized PnL as a percentage of margin used.
    pub unrealized_pnl_pct: f64,
    /// Highest `unrealized_pnl_pct` observed since this position opened.
    pub peak_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
    /// First-open wall-clock timestamp in epoch milliseconds. Survives
    /// restarts via the open-time store.
    pub opened_at_ms: i64,
}

impl Position {
    /// Current notional value at the mark price.
    pub fn notional(&self) -> f64 {
        self.quantity.abs() * self.mark_price
    }
}

/// Account snapshot. Invariant: `total_equity` equals
/// `available_balance + margin_used + unrealized_pnl` within rounding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Account {
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    /// Realized PnL since this process started.
    pub realized_pnl: f64,
    /// Realized PnL percent against the initial-equity baseline frozen on
    /// first observation.
    pub realized_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

// ============================================================================
// Decisions
// ============================================================================

/// Advisor action tag. The canonical set is what the risk engine accepts;
/// `ClosePosition` and `OpenPosition` are legacy aliases resolved by the
/// normalizer, and anything else deserializes to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    UpdateStopLoss,
    UpdateTakeProfit,
    PartialClose,
    Hold,
    Wait,
    // Legacy aliases, rewritten before validation.
    ClosePosition,
    OpenPosition,
    #[serde(other)]
    Unknown,
}

impl DecisionAction {
    pub fn is_open(&self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, DecisionAction::CloseLong | DecisionAction::CloseShort)
    }

    /// True for the nine actions the risk engine accepts.
    pub fn is_canonical(&self) -> bool {
        !matches!(
            self,
            DecisionAction::ClosePosition | DecisionAction::OpenPosition | DecisionAction::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::OpenLong => "open_long",
            DecisionAction::OpenShort => "open_short",
            DecisionAction::CloseLong => "close_long",
            DecisionAction::CloseShort => "close_short",
            DecisionAction::UpdateStopLoss => "update_stop_loss",
            DecisionAction::UpdateTakeProfit => "update_take_profit",
            DecisionAction::PartialClose => "partial_close",
            DecisionAction::Hold => "hold",
            DecisionAction::Wait => "wait",
            DecisionAction::ClosePosition => "close_position",
            DecisionAction::OpenPosition => "open_position",
            DecisionAction::Unknown => "unknown",
        }
    }
}

impl Default for DecisionAction {
    fn default() -> Self {
        DecisionAction::Wait
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome stamped on a decision after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Failed,
    Skipped,
}

/// One proposed trade from the advisor. Numeric fields default to zero so
/// the parser tolerates sparse objects; the risk engine decides what is
/// actually required per action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub action: DecisionAction,

    /// Side hint, only meaningful on the `open_position` alias:
    /// "long"/"buy" or "short"/"sell".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,

    // Open parameters.
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub position_size_usd: f64,
    /// Relative position size in (0,1] or (0,100].
    #[serde(default)]
    pub position_percent: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,

    // Update parameters.
    #[serde(default)]
    pub new_stop_loss: f64,
    #[serde(default)]
    pub new_take_profit: f64,
    /// Percentage in (0, 100] for partial_close.
    #[serde(default)]
    pub close_percentage: f64,

    // Common parameters.
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub risk_usd: f64,
    #[serde(default)]
    pub invalidation_condition: String,
    #[serde(default)]
    pub reasoning: String,

    // Filled in by the execution layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_status: Option<ExecStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_error: Option<String>,
}

/// The advisor's whole turn: prompts, chain-of-thought and decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullDecision {
    pub system_prompt: String,
    pub user_prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Context
// ============================================================================

/// Averaged price change across a named group of symbols.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sector {
    pub name: String,
    pub avg_change_1h: f64,
    pub avg_change_4h: f64,
    /// Member with the largest 1h change.
    pub leader: String,
}

/// The composed per-cycle input to the advisor and the dashboard.
///
/// The snapshot map is a `BTreeMap` so iteration order (and therefore the
/// generated user prompt) is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeContext {
    pub current_time: String,
    pub runtime_minutes: i64,
    pub cycle: u64,
    pub account: Account,
    pub positions: Vec<Position>,
    #[serde(skip)]
    pub market: BTreeMap<String, MarketSnapshot>,
    pub sectors: Vec<Sector>,
    pub sharpe_ratio: f64,
    #[serde(skip)]
    pub btc_eth_leverage: u32,
    #[serde(skip)]
    pub altcoin_leverage: u32,
}

// ============================================================================
// Trade history
// ============================================================================

/// A closed or partially-closed fill, kept for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Wall-clock time, "YYYY-MM-DD HH:MM:SS".
    pub time: String,
    pub symbol: String,
    pub side: Side,
    pub action: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub reason: String,
}
