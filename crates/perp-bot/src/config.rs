//! Configuration: JSON file with environment-variable fallback.
//!
//! The file (default `config.local.json`) is optional; every field can come
//! from the environment instead. A missing advisor API key is fatal at
//! startup, everything else has a default.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "config.local.json";

const MIN_LOOP_INTERVAL_SECS: u64 = 30;
const MAX_LOOP_INTERVAL_SECS: u64 = 900;
const DEFAULT_LOOP_INTERVAL_SECS: u64 = 150;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    // Advisor.
    pub advisor_api_key: String,
    pub advisor_api_url: String,
    pub advisor_model: String,

    /// Seconds between cycles; dashboard-adjustable within [30, 900].
    pub loop_interval_seconds: u64,

    // Trading.
    pub trading_symbols: Vec<String>,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,

    /// Starting capital for the simulated and backtest exchanges.
    pub initial_capital: f64,

    // Live exchange; empty keys select the simulated exchange.
    pub binance_api_key: String,
    pub binance_secret_key: String,
    pub binance_proxy_url: String,

    // Paths.
    pub data_dir: String,
    pub strategies_dir: String,
    pub backtest_data_dir: String,

    pub dashboard_port: u16,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            advisor_api_key: String::new(),
            advisor_api_url: "https://api.deepseek.com/v1/chat/completions".into(),
            advisor_model: "deepseek-chat".into(),
            loop_interval_seconds: DEFAULT_LOOP_INTERVAL_SECS,
            trading_symbols: vec![
                "BTCUSDT".into(),
                "ETHUSDT".into(),
                "SOLUSDT".into(),
                "BNBUSDT".into(),
                "DOGEUSDT".into(),
            ],
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            initial_capital: 1000.0,
            binance_api_key: String::new(),
            binance_secret_key: String::new(),
            binance_proxy_url: String::new(),
            data_dir: "data".into(),
            strategies_dir: "strategies".into(),
            backtest_data_dir: String::new(),
            dashboard_port: 8080,
        }
    }
}

impl BotConfig {
    /// Load from `path` when present, then fill gaps from the environment,
    /// then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let data = std::fs::read(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("parse config {}", path.display()))?
        } else {
            BotConfig::default()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment variables fill any field the file left empty.
    pub fn apply_env_overrides(&mut self) {
        let fill = |target: &mut String, var: &str| {
            if target.is_empty() {
                if let Ok(value) = std::env::var(var) {
                    *target = value;
                }
            }
        };
        fill(&mut self.advisor_api_key, "AI_API_KEY");
        fill(&mut self.advisor_api_url, "AI_API_URL");
        fill(&mut self.advisor_model, "AI_MODEL");
        fill(&mut self.binance_api_key, "BINANCE_API_KEY");
        fill(&mut self.binance_secret_key, "BINANCE_SECRET_KEY");
        fill(&mut self.binance_proxy_url, "BINANCE_PROXY_URL");

        if self.loop_interval_seconds == 0 {
            if let Some(secs) = std::env::var("AI_LOOP_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
            {
                self.loop_interval_seconds = secs;
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.advisor_api_key.is_empty() {
            bail!(
                "advisor API key is required: set `advisor_api_key` in {DEFAULT_CONFIG_FILE} \
                 or the AI_API_KEY environment variable"
            );
        }

        if self.loop_interval_seconds < MIN_LOOP_INTERVAL_SECS
            || self.loop_interval_seconds > MAX_LOOP_INTERVAL_SECS
        {
            warn!(
                configured = self.loop_interval_seconds,
                "loop interval out of [{MIN_LOOP_INTERVAL_SECS}, {MAX_LOOP_INTERVAL_SECS}], using default"
            );
            self.loop_interval_seconds = DEFAULT_LOOP_INTERVAL_SECS;
        }

        if self.trading_symbols.is_empty() {
            self.trading_symbols = BotConfig::default().trading_symbols;
        }
        if self.btc_eth_leverage == 0 {
            self.btc_eth_leverage = 10;
        }
        if self.altcoin_leverage == 0 {
            self.altcoin_leverage = 5;
        }
        if self.initial_capital <= 0.0 {
            self.initial_capital = 1000.0;
        }

        Ok(())
    }

    /// True when live credentials are configured.
    pub fn has_live_credentials(&self) -> bool {
        !self.binance_api_key.is_empty() && !self.binance_secret_key.is_empty()
    }

    pub fn proxy_url(&self) -> Option<&str> {
        if self.binance_proxy_url.is_empty() {
            None
        } else {
            Some(self.binance_proxy_url.as_str())
        }
    }

    /// Copy with secrets masked, for config snapshots and logs.
    pub fn redacted(&self) -> BotConfig {
        let mask = |s: &str| {
            if s.is_empty() {
                String::new()
            } else {
                "***".to_string()
            }
        };
        BotConfig {
            advisor_api_key: mask(&self.advisor_api_key),
            binance_api_key: mask(&self.binance_api_key),
            binance_secret_key: mask(&self.binance_secret_key),
            ..self.clone()
        }
    }
}
