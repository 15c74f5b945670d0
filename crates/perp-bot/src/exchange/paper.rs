//! Shared in-memory fill engine for the simulated and backtest adaptors.
//!
//! Both non-live variants fabricate positions the same way: margin moves
//! from available balance into the position on open and returns with
//! realized PnL on close. Keeping the bookkeeping in one place keeps the
//! equity identity (`equity = available + margin + unrealized`) identical
//! across paper trading and backtests.

use std::collections::{BTreeMap, HashMap};

use perp_common::Side;

use crate::types::{Account, Decision, DecisionAction, MarketSnapshot, Position};

use super::ExchangeError;

/// A partial close at or past this fraction is treated as a full close.
pub const FULL_CLOSE_EPSILON: f64 = 0.999;

/// Result of a close-type fill, for the caller's trade record.
#[derive(Debug, Clone)]
pub struct CloseFill {
    pub position: Position,
    pub closed_quantity: f64,
    pub pnl: f64,
    /// True when the position was removed entirely.
    pub fully_closed: bool,
    /// Percentage actually applied (100 for full closes).
    pub percentage: f64,
}

/// In-memory account and position bookkeeping.
#[derive(Debug)]
pub struct PaperEngine {
    pub account: Account,
    pub positions: HashMap<String, Position>,
    initial_equity: f64,
}

impl PaperEngine {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            account: Account {
                total_equity: initial_capital,
                available_balance: initial_capital,
                ..Default::default()
            },
            positions: HashMap::new(),
            initial_equity: initial_capital,
        }
    }

    /// Re-value positions at current marks and rebuild the account totals.
    pub fn revalue(&mut self, market: &BTreeMap<String, MarketSnapshot>) {
        let mut total_unrealized = 0.0;
        let mut total_margin = 0.0;

        for pos in self.positions.values_mut() {
            let Some(md) = market.get(&pos.symbol) else {
                continue;
            };
            pos.mark_price = md.current_price;
            pos.unrealized_pnl = match pos.side {
                Side::Long => (pos.mark_price - pos.entry_price) * pos.quantity,
                Side::Short => (pos.entry_price - pos.mark_price) * pos.quantity,
            };
            if pos.margin_used > 0.0 {
                pos.unrealized_pnl_pct = pos.unrealized_pnl / pos.margin_used * 100.0;
                if pos.unrealized_pnl_pct > pos.peak_pnl_pct {
                    pos.peak_pnl_pct = pos.unrealized_pnl_pct;
                }
            }
            total_unrealized += pos.unrealized_pnl;
            total_margin += pos.margin_used;
        }

        let acct = &mut self.account;
        acct.unrealized_pnl = total_unrealized;
        acct.margin_used = total_margin;
        acct.total_equity = acct.available_balance + acct.margin_used + acct.unrealized_pnl;
        acct.margin_used_pct = if acct.total_equity > 0.0 {
            acct.margin_used / acct.total_equity * 100.0
        } else {
            0.0
        };
        acct.position_count = self.positions.len();

        if self.initial_equity > 0.0 {
            acct.realized_pnl = acct.total_equity - self.initial_equity - acct.unrealized_pnl;
            acct.realized_pnl_pct =
                (acct.total_equity - self.initial_equity) / self.initial_equity * 100.0;
        }
    }

    /// Open or add to a position at `price`.
    pub fn open(
        &mut self,
        d: &Decision,
        price: f64,
        now_ms: i64,
    ) -> Result<(), ExchangeError> {
        let leverage = d.leverage.max(1);
        let margin_required = d.position_size_usd / leverage as f64;
        if self.account.available_balance < margin_required {
            return Err(ExchangeError::InsufficientBalance {
                available: self.account.available_balance,
                required: margin_required,
            });
        }

        let quantity = d.position_size_usd / price;
        let side = if d.action == DecisionAction::OpenLong {
            Side::Long
        } else {
            Side::Short
        };

        if let Some(pos) = self.positions.get_mut(&d.symbol) {
            if pos.side != side {
                return Err(ExchangeError::PositionConflict {
                    symbol: d.symbol.clone(),
                    existing: pos.side,
                });
            }
            // Addition: size-weighted average entry, additive margin.
            let total_qty = pos.quantity + quantity;
            pos.entry_price = (pos.entry_price * pos.quantity + price * quantity) / total_qty;
            pos.quantity = total_qty;
            pos.margin_used += margin_required;
            pos.leverage = leverage;
        } else {
            self.positions.insert(
                d.symbol.clone(),
                Position {
                    symbol: d.symbol.clone(),
                    side,
                    entry_price: price,
                    mark_price: price,
                    quantity,
                    leverage,
                    unrealized_pnl: 0.0,
                    unrealized_pnl_pct: 0.0,
                    peak_pnl_pct: 0.0,
                    liquidation_price: 0.0,
                    margin_used: margin_required,
                    opened_at_ms: now_ms,
                },
            );
        }

        self.account.available_balance -= margin_required;
        Ok(())
    }

    /// Close the full position matching `expected` at `price`.
    pub fn close(
        &mut self,
        symbol: &str,
        expected: Side,
        price: f64,
        action: &str,
    ) -> Result<CloseFill, ExchangeError> {
        let pos = match self.positions.get(symbol) {
            Some(p) if p.side == expected => p.clone(),
            Some(p) => {
                return Err(ExchangeError::PositionConflict {
                    symbol: symbol.to_string(),
                    existing: p.side,
                })
            }
            None => {
                return Err(ExchangeError::NoPosition {
                    symbol: symbol.to_string(),
                    action: action.to_string(),
                })
            }
        };

        let pnl = match pos.side {
            Side::Long => (price - pos.entry_price) * pos.quantity,
            Side::Short => (pos.entry_price - price) * pos.quantity,
        };

        self.account.available_balance += pos.margin_used + pnl;
        self.positions.remove(symbol);

        Ok(CloseFill {
            closed_quantity: pos.quantity,
            pnl,
            fully_closed: true,
            percentage: 100.0,
            position: pos,
        })
    }

    /// Close part of a position. The percentage comes from the decision, or
    /// is derived from its notional when absent. pct >= 99.9% is promoted to
    /// a full close.
    pub fn partial_close(
        &mut self,
        d: &Decision,
        price: f64,
    ) -> Result<CloseFill, ExchangeError> {
        let pos = match self.positions.get(&d.symbol) {
            Some(p) => p.clone(),
            None => {
                return Err(ExchangeError::NoPosition {
                    symbol: d.symbol.clone(),
                    action: d.action.to_string(),
                })
            }
        };

        let mut pct = d.close_percentage / 100.0;
        if pct <= 0.0 {
            let notional = pos.quantity * price;
            if d.position_size_usd <= 0.0 || notional <= 0.0 {
                return Err(ExchangeError::InvalidParameter(format!(
                    "cannot derive close percentage for {} (close_percentage={:.2}, notional={:.2})",
                    d.symbol, d.close_percentage, d.position_size_usd
                )));
            }
            pct = (d.position_size_usd / notional).min(1.0);
        }
        pct = pct.min(1.0);

        if pct >= FULL_CLOSE_EPSILON {
            return self.close(&d.symbol, pos.side, price, "partial_close");
        }

        let close_qty = pos.quantity * pct;
        let closed_margin = pos.margin_used * pct;
        let pnl = match pos.side {
            Side::Long => (price - pos.entry_price) * close_qty,
            Side::Short => (pos.entry_price - price) * close_qty,
        };

        self.account.available_balance += closed_margin + pnl;
        if let Some(p) = self.positions.get_mut(&d.symbol) {
            p.quantity -= close_qty;
            p.margin_used -= closed_margin;
        }

        Ok(CloseFill {
            position: pos,
            closed_quantity: close_qty,
            pnl,
            fully_closed: false,
            percentage: pct * 100.0,
        })
    }

    pub fn sorted_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }
}
