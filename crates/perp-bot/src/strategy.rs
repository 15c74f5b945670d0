//! Strategy templates and the strategy manager.
//!
//! A strategy bundles the advisor's prose prompt with the risk parameters
//! the risk engine enforces. Four built-in templates ship with the agent;
//! custom ones can be layered on top. The active strategy drives both the
//! system prompt and every numeric risk limit, so switching strategies is
//! the single knob that changes the agent's character.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Risk parameters enforced by the risk engine, per strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskParams {
    /// Maximum single-trade risk as a fraction of account equity.
    pub max_risk_per_trade: f64,
    /// Maximum summed risk of all new opens in one cycle, as a fraction of
    /// equity.
    pub max_total_risk: f64,
    /// Minimum reward:risk ratio for non-probe opens.
    pub min_risk_reward: f64,
    /// Fixed leverage applied to every open, overriding the advisor.
    pub fixed_leverage: u32,
    /// Maximum fraction of available balance a single trade's margin may
    /// consume.
    pub max_margin_usage: f64,
    /// Advisory stop-loss distance in ATR multiples, surfaced in the prompt.
    pub stop_loss_atr_multiple: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        // The balanced template.
        Self {
            max_risk_per_trade: 0.25,
            max_total_risk: 0.40,
            min_risk_reward: 2.0,
            fixed_leverage: 15,
            max_margin_usage: 0.70,
            stop_loss_atr_multiple: 1.8,
        }
    }
}

/// A named strategy: prompt prose plus risk parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub description: String,
    /// Prompt template file under the strategies directory; empty means the
    /// built-in prose for this strategy.
    pub prompt_file: String,
    /// Optional symbol override for this strategy.
    #[serde(default)]
    pub symbols: Vec<String>,
    pub risk_params: RiskParams,
}

fn builtin_strategies() -> Vec<Strategy> {
    vec![
        Strategy {
            name: "balanced".into(),
            description: "moderate risk, steady trading".into(),
            prompt_file: "balanced.md".into(),
            symbols: vec![],
            risk_params: RiskParams::default(),
        },
        Strategy {
            name: "aggressive".into(),
            description: "high risk, high reward".into(),
            prompt_file: "aggressive.md".into(),
            symbols: vec![],
            risk_params: RiskParams {
                max_risk_per_trade: 0.50,
                max_total_risk: 0.50,
                min_risk_reward: 1.8,
                fixed_leverage: 30,
                max_margin_usage: 0.95,
                stop_loss_atr_multiple: 1.5,
            },
        },
        Strategy {
            name: "conservative".into(),
            description: "low risk, stable returns".into(),
            prompt_file: "conservative.md".into(),
            symbols: vec![],
            risk_params: RiskParams {
                max_risk_per_trade: 0.10,
                max_total_risk: 0.30,
                min_risk_reward: 2.5,
                fixed_leverage: 5,
                max_margin_usage: 0.50,
                stop_loss_atr_multiple: 2.0,
            },
        },
        Strategy {
            name: "scalping".into(),
            description: "fast in, fast out".into(),
            prompt_file: "scalping.md".into(),
            symbols: vec![],
            risk_params: RiskParams {
                max_risk_per_trade: 0.05,
                max_total_risk: 0.20,
                min_risk_reward: 1.5,
                fixed_leverage: 20,
                max_margin_usage: 0.30,
                stop_loss_atr_multiple: 0.8,
            },
        },
    ]
}

/// Built-in prose used when no prompt file is found on disk.
const FALLBACK_PROMPT: &str = "You are a disciplined cryptocurrency trading \
assistant operating on USDT-margined perpetual futures. You receive a full \
market context each cycle and must respond with a <reasoning> section \
followed by a <decision> section containing a JSON array of decisions. Risk \
limits are enforced by the backend; never exceed them. Prefer doing nothing \
over taking a low-quality trade.";

/// Holds all known strategies and the active selection.
///
/// Constructed once at startup and shared behind the engine; there is no
/// global instance.
#[derive(Debug)]
pub struct StrategyManager {
    strategies: HashMap<String, Strategy>,
    active: String,
    strategies_dir: PathBuf,
}

impl StrategyManager {
    pub fn new(strategies_dir: impl Into<PathBuf>) -> Self {
        let mut strategies = HashMap::new();
        for s in builtin_strategies() {
            strategies.insert(s.name.clone(), s);
        }
        Self {
            strategies,
            active: "balanced".into(),
            strategies_dir: strategies_dir.into(),
        }
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn active(&self) -> &Strategy {
        self.strategies
            .get(&self.active)
            .or_else(|| self.strategies.get("balanced"))
            .expect("built-in balanced strategy always present")
    }

    pub fn set_active(&mut self, name: &str) -> Result<(), String> {
        if !self.strategies.contains_key(name) {
            return Err(format!("strategy not found: {name}"));
        }
        self.active = name.to_string();
        Ok(())
    }

    pub fn risk_params(&self) -> RiskParams {
        self.active().risk_params
    }

    /// Symbols for the active strategy, or the configured defaults.
    pub fn symbols<'a>(&'a self, default_symbols: &'a [String]) -> &'a [String] {
        let s = self.active();
        if s.symbols.is_empty() {
            default_symbols
        } else {
            &s.symbols
        }
    }

    pub fn list(&self) -> Vec<&Strategy> {
        let mut all: Vec<&Strategy> = self.strategies.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn add(&mut self, strategy: Strategy) -> Result<(), String> {
        if strategy.name.is_empty() {
            return Err("strategy name cannot be empty".into());
        }
        self.strategies.insert(strategy.name.clone(), strategy);
        Ok(())
    }

    /// Prose prompt for the active strategy: the on-disk template when
    /// present, the built-in fallback otherwise.
    pub fn prompt_prose(&self) -> String {
        let strategy = self.active();
        if !strategy.prompt_file.is_empty() {
            let path = self.strategies_dir.join(&strategy.prompt_file);
            match std::fs::read_to_string(&path) {
                Ok(content) if !content.trim().is_empty() => return content,
                Ok(_) => {}
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), error = %e, "failed to read strategy prompt, using fallback");
                }
                Err(_) => {}
            }
        }
        FALLBACK_PROMPT.to_string()
    }

    /// Per-strategy guidance lines appended to the system prompt.
    pub fn guidance(&self) -> &'static str {
        match self.active_name() {
            "aggressive" => {
                "- Aggressive mode: pursue outsized gains and accept elevated risk.\n\
                 - Press winners hard when the trend is clear, but honour every stop.\n\
                 - Prioritise breakouts and trend continuation setups.\n"
            }
            "conservative" => {
                "- Conservative mode: protect capital first.\n\
                 - Only enter on high-conviction setups; missing a move is fine.\n\
                 - Prefer pullback entries at well-defined support or resistance.\n"
            }
            "scalping" => {
                "- Scalping mode: very short holding periods.\n\
                 - Small size, many attempts, quick exits in both directions.\n\
                 - Watch 5m/15m structure and volume anomalies for timing.\n"
            }
            _ => {
                "- Balanced mode: moderate risk, steady execution.\n\
                 - Size up only when trend and reward:risk both line up; otherwise wait.\n\
                 - Use daily/4h for regime, 4h/1h for pullback entries.\n"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let sm = StrategyManager::new("strategies");
        let names: Vec<&str> = sm.list().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["aggressive", "balanced", "conservative", "scalping"]
        );
        assert_eq!(sm.active_name(), "balanced");
    }

    #[test]
    fn switching_strategy_changes_risk_params() {
        let mut sm = StrategyManager::new("strategies");
        assert_eq!(sm.risk_params().fixed_leverage, 15);
        sm.set_active("scalping").unwrap();
        assert_eq!(sm.risk_params().fixed_leverage, 20);
        assert_eq!(sm.risk_params().max_total_risk, 0.20);
        assert!(sm.set_active("nope").is_err());
        // Failed switch leaves the active strategy alone.
        assert_eq!(sm.active_name(), "scalping");
    }

    #[test]
    fn prompt_falls_back_without_file() {
        let sm = StrategyManager::new("/definitely/not/a/dir");
        let prose = sm.prompt_prose();
        assert!(prose.contains("<decision>"));
    }

    #[test]
    fn custom_strategy_can_be_added() {
        let mut sm = StrategyManager::new("strategies");
        sm.add(Strategy {
            name: "weekend".into(),
            description: "weekend drift".into(),
            prompt_file: String::new(),
            symbols: vec!["BTCUSDT".into()],
            risk_params: RiskParams::default(),
        })
        .unwrap();
        sm.set_active("weekend").unwrap();
        let defaults = vec!["ETHUSDT".to_string()];
        assert_eq!(sm.symbols(&defaults), &["BTCUSDT".to_string()]);
    }
}
