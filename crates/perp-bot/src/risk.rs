//! Risk engine: validates, rewrites, clamps or rejects advisor decisions.
//!
//! Decisions are checked in order against per-trade, cross-trade and
//! position-update rules. Clamps mutate the decision in place and execution
//! proceeds; a rejection fails the whole batch for the cycle. A running sum
//! of per-decision risk (as a fraction of equity) enforces the per-cycle
//! total risk budget.
//!
//! ## Check order for opens
//!
//! 1. Equity sanity, forced leverage
//! 2. Notional derivation (absolute or relative size)
//! 3. Size cap vs equity x leverage, margin cap vs available balance
//! 4. Stop/take presence and side relationship
//! 5. Entry estimate, price risk, single-trade risk clamp
//! 6. Global risk budget
//! 7. Reward:risk floor (two-tier "probe" ladder)

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use perp_common::is_major;

use crate::strategy::RiskParams;
use crate::types::{Account, Decision, DecisionAction, MarketSnapshot};

/// Hard limits shared by every strategy.
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    /// Suggested minimum notional; below it the exchange may reject the
    /// order for minimum-notional reasons, so we warn but do not block.
    pub min_notional_suggested: f64,
    /// Fraction of available balance treated as actually spendable.
    pub safety_reserve: f64,
    /// Absolute cap on single-trade risk in quote units.
    pub hard_risk_cap_usd: f64,
    /// Tighter absolute cap for non-BTC/ETH symbols.
    pub altcoin_risk_cap_usd: f64,
    /// Stop-distance floor for update_stop_loss, in percent of price.
    pub min_stop_distance_pct: f64,
    /// Stop-distance ATR buffer: fraction of the 5m ATR14 kept between the
    /// stop and the current price.
    pub stop_distance_atr_factor: f64,
    /// Single-trade risk (fraction of equity) at or below which the lower
    /// probe R:R floor applies.
    pub probe_risk_fraction: f64,
    /// R:R floor for probe-sized trades.
    pub probe_min_rr: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            min_notional_suggested: 12.0,
            safety_reserve: 0.88,
            hard_risk_cap_usd: 50.0,
            altcoin_risk_cap_usd: 20.0,
            min_stop_distance_pct: 0.18,
            stop_distance_atr_factor: 0.35,
            probe_risk_fraction: 0.015,
            probe_min_rr: 1.0,
        }
    }
}

/// Why a decision was rejected. A rejection aborts the whole batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RejectReason {
    #[error("account equity is zero or negative")]
    ZeroEquity,
    #[error("position size must be positive, got {0:.2}")]
    InvalidNotional(f64),
    #[error("position_percent out of range: {0:.4} (expected (0,1] or (0,100])")]
    InvalidPositionPercent(f64),
    #[error("no available balance to size a relative position")]
    NoAvailableBalance,
    #[error("available margin cannot support any position")]
    MarginExhausted,
    #[error("stop loss and take profit must both be positive")]
    MissingProtectiveLevels,
    #[error("long requires stop loss below take profit")]
    LongStopAboveTake,
    #[error("short requires stop loss above take profit")]
    ShortStopBelowTake,
    #[error("cannot estimate an entry price for risk assessment")]
    NoEntryEstimate,
    #[error("price risk is not positive ({0:.4}%)")]
    NonPositiveRisk(f64),
    #[error("cycle risk budget exhausted ({used:.2}% of {budget:.2}% already allocated)")]
    RiskBudgetExhausted { used: f64, budget: f64 },
    #[error("reward:risk {rr:.2}:1 below required {min:.1}:1 (risk {risk_pct:.2}%, reward {reward_pct:.2}%)")]
    RewardRiskTooLow {
        rr: f64,
        min: f64,
        risk_pct: f64,
        reward_pct: f64,
    },
    #[error("new stop loss must be positive, got {0:.4}")]
    InvalidNewStopLoss(f64),
    #[error("new take profit must be positive, got {0:.4}")]
    InvalidNewTakeProfit(f64),
    #[error("close percentage must be in (0,100], got {0:.1}")]
    InvalidClosePercentage(f64),
}

/// Batch-level risk failure, carrying the offending decision.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("decision #{index} ({symbol} {action}) rejected: {reason}")]
pub struct RiskError {
    pub index: usize,
    pub symbol: String,
    pub action: String,
    pub reason: RejectReason,
}

/// Validates advisor decision batches against the active strategy.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    params: RiskParams,
    limits: RiskLimits,
}

impl RiskEngine {
    pub fn new(params: RiskParams) -> Self {
        Self {
            params,
            limits: RiskLimits::default(),
        }
    }

    pub fn with_limits(params: RiskParams, limits: RiskLimits) -> Self {
        Self { params, limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Validate a whole batch in order, mutating decisions in place where
    /// clamps apply. The first rejection fails the batch.
    pub fn validate_batch(
        &self,
        decisions: &mut [Decision],
        account: &Account,
        market: &BTreeMap<String, MarketSnapshot>,
    ) -> Result<(), RiskError> {
        let mut total_risk_fraction = 0.0;
        for (index, d) in decisions.iter_mut().enumerate() {
            self.validate_decision(d, account, market, &mut total_risk_fraction)
                .map_err(|reason| RiskError {
                    index,
                    symbol: d.symbol.clone(),
                    action: d.action.to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    fn validate_decision(
        &self,
        d: &mut Decision,
        account: &Account,
        market: &BTreeMap<String, MarketSnapshot>,
        total_risk_fraction: &mut f64,
    ) -> Result<(), RejectReason> {
        if !d.action.is_canonical() {
            warn!(symbol = %d.symbol, action = %d.action, "unknown action downgraded to wait");
            d.action = DecisionAction::Wait;
            return Ok(());
        }

        match d.action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => {
                self.validate_open(d, account, market, total_risk_fraction)
            }
            DecisionAction::UpdateStopLoss => self.validate_stop_update(d, market),
            DecisionAction::UpdateTakeProfit => {
                if d.new_take_profit <= 0.0 {
                    return Err(RejectReason::InvalidNewTakeProfit(d.new_take_profit));
                }
                Ok(())
            }
            DecisionAction::PartialClose => self.validate_partial_close(d),
            // Parameter-free actions.
            DecisionAction::CloseLong
            | DecisionAction::CloseShort
            | DecisionAction::Hold
            | DecisionAction::Wait => Ok(()),
            _ => unreachable!("non-canonical actions handled above"),
        }
    }

    fn validate_open(
        &self,
        d: &mut Decision,
        account: &Account,
        market: &BTreeMap<String, MarketSnapshot>,
        total_risk_fraction: &mut f64,
    ) -> Result<(), RejectReason> {
        let equity = account.total_equity;
        let available = account.available_balance;
        if equity <= 0.0 {
            return Err(RejectReason::ZeroEquity);
        }

        let leverage = self.params.fixed_leverage;
        if d.leverage != leverage {
            info!(
                symbol = %d.symbol,
                proposed = d.leverage,
                forced = leverage,
                "leverage forced to the strategy's fixed value"
            );
            d.leverage = leverage;
        }
        let lev = leverage as f64;

        // Relative sizing when no absolute notional was given.
        if d.position_size_usd <= 0.0 && d.position_percent > 0.0 {
            let mut pct = d.position_percent;
            if pct > 1.0 {
                pct /= 100.0;
            }
            if pct <= 0.0 || pct > 1.0 {
                return Err(RejectReason::InvalidPositionPercent(d.position_percent));
            }
            if available <= 0.0 {
                return Err(RejectReason::NoAvailableBalance);
            }
            let margin_budget = available * self.limits.safety_reserve * pct;
            if margin_budget <= 0.0 {
                return Err(RejectReason::InvalidNotional(margin_budget));
            }
            d.position_size_usd = margin_budget * lev;
            info!(
                symbol = %d.symbol,
                percent = d.position_percent,
                notional = d.position_size_usd,
                "position sized from position_percent"
            );
        }

        if d.position_size_usd <= 0.0 {
            return Err(RejectReason::InvalidNotional(d.position_size_usd));
        }

        if d.position_size_usd < self.limits.min_notional_suggested {
            warn!(
                symbol = %d.symbol,
                notional = d.position_size_usd,
                minimum = self.limits.min_notional_suggested,
                "notional below the suggested minimum, executing anyway"
            );
        }

        // Hard size cap: equity x leverage, with 1% tolerance.
        let max_position_value = equity * lev;
        if d.position_size_usd > max_position_value * 1.01 {
            warn!(
                symbol = %d.symbol,
                notional = d.position_size_usd,
                cap = max_position_value,
                "[Size Fallback] notional above equity x leverage, capped"
            );
            d.position_size_usd = max_position_value;
        }

        // Per-trade margin cap against available balance.
        if available > 0.0 {
            let margin_required = d.position_size_usd / lev;
            let max_margin =
                available * self.params.max_margin_usage * self.limits.safety_reserve;
            if margin_required > max_margin {
                if max_margin <= 0.0 {
                    return Err(RejectReason::MarginExhausted);
                }
                let shrunk = max_margin * lev;
                warn!(
                    symbol = %d.symbol,
                    margin_required,
                    max_margin,
                    notional = shrunk,
                    "[Margin Fallback] margin above per-trade cap, position shrunk"
                );
                d.position_size_usd = shrunk;
            }
        }

        if d.stop_loss <= 0.0 || d.take_profit <= 0.0 {
            return Err(RejectReason::MissingProtectiveLevels);
        }
        let is_long = d.action == DecisionAction::OpenLong;
        if is_long && d.stop_loss >= d.take_profit {
            return Err(RejectReason::LongStopAboveTake);
        }
        if !is_long && d.stop_loss <= d.take_profit {
            return Err(RejectReason::ShortStopBelowTake);
        }

        // Entry estimate: market price preferred, SL/TP interpolation as a
        // fallback.
        let mut entry = market
            .get(&d.symbol)
            .map(|m| m.current_price)
            .filter(|p| *p > 0.0)
            .unwrap_or(0.0);
        if entry <= 0.0 {
            entry = if is_long {
                d.stop_loss + (d.take_profit - d.stop_loss) * 0.2
            } else {
                d.stop_loss - (d.stop_loss - d.take_profit) * 0.2
            };
        }
        if entry <= 0.0 {
            return Err(RejectReason::NoEntryEstimate);
        }

        let risk_pct = (entry - d.stop_loss).abs() / entry * 100.0;
        let reward_pct = if is_long {
            (d.take_profit - entry) / entry * 100.0
        } else {
            (entry - d.take_profit) / entry * 100.0
        };
        if risk_pct <= 0.0 {
            return Err(RejectReason::NonPositiveRisk(risk_pct));
        }
        let mut rr = reward_pct / risk_pct;

        // Single-trade risk clamp: strategy fraction, then the absolute
        // caps.
        let mut risk_usd = d.position_size_usd * risk_pct / 100.0;
        let strategy_cap = equity * self.params.max_risk_per_trade;
        let mut cap = strategy_cap.min(self.limits.hard_risk_cap_usd);
        let alt_capped = !is_major(&d.symbol) && self.limits.altcoin_risk_cap_usd < cap;
        if alt_capped {
            cap = self.limits.altcoin_risk_cap_usd;
        }
        if cap > 0.0 && risk_usd > cap {
            let shrunk = cap * 100.0 / risk_pct;
            let marker = if alt_capped {
                "[Alt Risk Fallback]"
            } else {
                "[Risk Fallback]"
            };
            warn!(
                symbol = %d.symbol,
                risk_usd,
                cap,
                notional = shrunk,
                "{marker} single-trade risk above cap, position shrunk"
            );
            d.position_size_usd = shrunk;
            risk_usd = cap;
        }

        // Global per-cycle budget.
        let mut risk_fraction = risk_usd / equity;
        let budget = self.params.max_total_risk;
        if *total_risk_fraction + risk_fraction > budget {
            let remaining = budget - *total_risk_fraction;
            if remaining <= 0.0 {
                return Err(RejectReason::RiskBudgetExhausted {
                    used: *total_risk_fraction * 100.0,
                    budget: budget * 100.0,
                });
            }
            let shrunk = remaining * equity * 100.0 / risk_pct;
            warn!(
                symbol = %d.symbol,
                requested_pct = risk_fraction * 100.0,
                remaining_pct = remaining * 100.0,
                notional = shrunk,
                "[Global Risk Fallback] cycle risk budget nearly spent, position shrunk"
            );
            d.position_size_usd = shrunk;
            risk_usd = remaining * equity;
            risk_fraction = remaining;
        }
        *total_risk_fraction += risk_fraction;
        d.risk_usd = risk_usd;

        // Two-tier R:R floor: probe-sized trades get the lower bar.
        let min_rr = if risk_fraction > self.limits.probe_risk_fraction {
            self.params.min_risk_reward
        } else {
            self.limits.probe_min_rr
        };
        if !rr.is_finite() {
            rr = 0.0;
        }
        if rr < min_rr {
            return Err(RejectReason::RewardRiskTooLow {
                rr,
                min: min_rr,
                risk_pct,
                reward_pct,
            });
        }

        Ok(())
    }

    fn validate_stop_update(
        &self,
        d: &mut Decision,
        market: &BTreeMap<String, MarketSnapshot>,
    ) -> Result<(), RejectReason> {
        // Models sometimes put the new stop in stop_loss; adopt it.
        if d.new_stop_loss <= 0.0 && d.stop_loss > 0.0 {
            info!(
                symbol = %d.symbol,
                adopted = d.stop_loss,
                "update_stop_loss used the stop_loss field, adopting it"
            );
            d.new_stop_loss = d.stop_loss;
        }
        if d.new_stop_loss <= 0.0 {
            return Err(RejectReason::InvalidNewStopLoss(d.new_stop_loss));
        }

        // A stop hugging the current price gets swept by noise between
        // cycles. Too-close updates degrade to a no-op instead of killing
        // the batch.
        if let Some(md) = market.get(&d.symbol) {
            let price = md.current_price;
            if price > 0.0 {
                let dist_pct = if d.new_stop_loss < price {
                    (price - d.new_stop_loss) / price * 100.0
                } else {
                    (d.new_stop_loss - price) / price * 100.0
                };

                let mut min_pct = self.limits.min_stop_distance_pct;
                let atr = md.tf_5m.atr14;
                if atr > 0.0 {
                    let atr_buffer = atr / price * 100.0 * self.limits.stop_distance_atr_factor;
                    if atr_buffer > min_pct {
                        min_pct = atr_buffer;
                    }
                }

                if dist_pct > 0.0 && dist_pct < min_pct {
                    warn!(
                        symbol = %d.symbol,
                        new_stop = d.new_stop_loss,
                        distance_pct = dist_pct,
                        required_pct = min_pct,
                        "new stop too close to price, downgrading to hold"
                    );
                    d.action = DecisionAction::Hold;
                }
            }
        }

        Ok(())
    }

    fn validate_partial_close(&self, d: &mut Decision) -> Result<(), RejectReason> {
        if d.close_percentage > 0.0 && d.close_percentage <= 100.0 {
            return Ok(());
        }
        if d.close_percentage <= 0.0 && d.position_size_usd > 0.0 {
            // Execution derives the percentage from the notional.
            info!(
                symbol = %d.symbol,
                notional = d.position_size_usd,
                "[Partial Fallback] close percentage absent, deriving from notional at execution"
            );
            return Ok(());
        }
        Err(RejectReason::InvalidClosePercentage(d.close_percentage))
    }
}
