//! Pre-risk decision normalization.
//!
//! Maps legacy advisor aliases (`close_position`, `open_position`) onto the
//! canonical action set using the currently held positions, and applies the
//! defensive-mode override that blocks new opens while drawdown is deep.
//! Unknown actions pass through untouched; the risk engine downgrades them.

use std::collections::HashMap;

use tracing::{info, warn};

use perp_common::Side;

use crate::types::{Decision, DecisionAction, Position};

/// Drawdown from peak equity at which new opens are suppressed.
pub const DEFENSIVE_DRAWDOWN: f64 = 0.25;

/// Index positions by symbol for side lookups. With hedge mode both sides
/// can exist; the first side wins, which matches the alias's ambiguity.
pub fn position_sides(positions: &[Position]) -> HashMap<String, Side> {
    let mut map = HashMap::new();
    for p in positions {
        map.entry(p.symbol.clone()).or_insert(p.side);
    }
    map
}

/// Rewrite alias actions to canonical ones in place.
pub fn normalize_decisions(decisions: &mut [Decision], positions: &[Position]) {
    let sides = position_sides(positions);

    for d in decisions.iter_mut() {
        match d.action {
            DecisionAction::ClosePosition => match sides.get(&d.symbol) {
                Some(Side::Long) => {
                    info!(symbol = %d.symbol, "close_position resolved to close_long");
                    d.action = DecisionAction::CloseLong;
                }
                Some(Side::Short) => {
                    info!(symbol = %d.symbol, "close_position resolved to close_short");
                    d.action = DecisionAction::CloseShort;
                }
                None => {
                    warn!(symbol = %d.symbol, "close_position with no open position, rewriting to wait");
                    d.action = DecisionAction::Wait;
                }
            },
            DecisionAction::OpenPosition => {
                let side = d.side.as_deref().map(str::to_ascii_lowercase);
                match side.as_deref() {
                    Some("long") | Some("buy") => d.action = DecisionAction::OpenLong,
                    Some("short") | Some("sell") => d.action = DecisionAction::OpenShort,
                    other => {
                        warn!(
                            symbol = %d.symbol,
                            side = ?other,
                            "open_position with unusable side hint, rewriting to wait"
                        );
                        d.action = DecisionAction::Wait;
                    }
                }
            }
            _ => {}
        }
    }
}

/// While drawdown from peak equity is at or beyond the defensive threshold,
/// rewrite every new open to `wait`. Closes and updates pass through so the
/// advisor can still reduce exposure.
pub fn apply_defensive_mode(decisions: &mut [Decision], drawdown: f64) {
    if drawdown < DEFENSIVE_DRAWDOWN {
        return;
    }

    for d in decisions.iter_mut() {
        if d.action.is_open() {
            warn!(
                symbol = %d.symbol,
                action = %d.action,
                drawdown_pct = drawdown * 100.0,
                "defensive mode: open suppressed while drawdown exceeds threshold"
            );
            d.action = DecisionAction::Wait;
        }
    }
}
