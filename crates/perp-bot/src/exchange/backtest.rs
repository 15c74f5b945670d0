//! Backtest exchange: replays historical 3m klines from CSV files.
//!
//! Each call to `refresh_market_data` advances one 3m step; the 15m/30m/
//! 1h/4h timeframes are derived by aggregation so the snapshot shape
//! matches the live adaptor. When the shortest symbol series is exhausted
//! the refresh returns `ExchangeError::BacktestFinished` and the loop
//! stops cleanly.
//!
//! CSV format (header row permitted):
//! `open,high,low,close,volume,taker_buy_volume,close_time_ms`

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use perp_common::{Kline, Side};

use crate::history::TradeHistoryManager;
use crate::indicators;
use crate::types::{
    Account, Decision, DecisionAction, MarketSnapshot, Position, Sentiment, TimeframeIndicators,
    TradeRecord,
};

use super::paper::PaperEngine;
use super::{Exchange, ExchangeError};

// Aggregation factors from the 3m base series. A 5m bundle is not
// derivable from 3m bars and stays unpopulated in backtests.
const GROUP_15M: usize = 5;
const GROUP_30M: usize = 10;
const GROUP_1H: usize = 20;
const GROUP_4H: usize = 80;

struct BacktestState {
    paper: PaperEngine,
    market: BTreeMap<String, MarketSnapshot>,
    step: usize,
}

/// CSV-driven backtest exchange.
pub struct BacktestExchange {
    data: HashMap<String, Vec<Kline>>,
    max_step: usize,
    state: RwLock<BacktestState>,
    history: TradeHistoryManager,
}

/// Parse one CSV file of 3m klines. A header row is detected by a
/// non-numeric first field and skipped; short rows are ignored.
pub fn load_klines_csv(path: &Path) -> Result<Vec<Kline>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;

    let mut klines = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("read {} line {}", path.display(), line + 1))?;
        if record.len() < 6 {
            continue;
        }
        let parse = |i: usize| record.get(i).unwrap_or("").trim().parse::<f64>();

        let open = match parse(0) {
            Ok(v) => v,
            // Header row.
            Err(_) if line == 0 => continue,
            Err(e) => bail!("{} line {}: bad open: {}", path.display(), line + 1, e),
        };

        let close_time = record
            .get(6)
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or_default();

        klines.push(Kline {
            open,
            high: parse(1).unwrap_or_default(),
            low: parse(2).unwrap_or_default(),
            close: parse(3).unwrap_or_default(),
            volume: parse(4).unwrap_or_default(),
            taker_buy_volume: parse(5).unwrap_or_default(),
            close_time,
        });
    }

    Ok(klines)
}

impl BacktestExchange {
    /// Load `{SYMBOL}_3m.csv` for every symbol from `data_dir`. The
    /// shortest series bounds the run.
    pub fn from_csv_dir(
        initial_capital: f64,
        data_dir: &Path,
        symbols: &[String],
        history: TradeHistoryManager,
    ) -> Result<Self> {
        if symbols.is_empty() {
            bail!("no symbols configured for backtest");
        }

        let mut data = HashMap::new();
        let mut min_len = usize::MAX;
        for symbol in symbols {
            let path = data_dir.join(format!("{symbol}_3m.csv"));
            let klines =
                load_klines_csv(&path).with_context(|| format!("load klines for {symbol}"))?;
            if klines.is_empty() {
                bail!("no klines loaded for {symbol}");
            }
            min_len = min_len.min(klines.len());
            data.insert(symbol.clone(), klines);
        }

        if min_len <= 1 {
            bail!("not enough backtest data (shortest series has {min_len} bars)");
        }

        info!(
            symbols = symbols.len(),
            steps = min_len,
            "backtest data loaded"
        );

        Ok(Self {
            data,
            max_step: min_len,
            state: RwLock::new(BacktestState {
                paper: PaperEngine::new(initial_capital),
                market: BTreeMap::new(),
                step: 0,
            }),
            history,
        })
    }

    /// Total number of 3m steps available.
    pub fn total_steps(&self) -> usize {
        self.max_step
    }

    fn build_snapshot(symbol: &str, series: &[Kline]) -> MarketSnapshot {
        let current = series[series.len() - 1];
        let current_price = current.close;

        let klines_15m = indicators::aggregate(series, GROUP_15M);
        let klines_30m = indicators::aggregate(series, GROUP_30M);
        let klines_1h = indicators::aggregate(series, GROUP_1H);
        let klines_4h = indicators::aggregate(series, GROUP_4H);

        let tf = |bars: &[Kline]| TimeframeIndicators {
            ema20: indicators::ema(bars, 20),
            macd: indicators::macd(bars),
            rsi14: indicators::rsi(bars, 14),
            atr14: indicators::atr(bars, 14),
        };

        // 1h change against the previous aggregated 1h close, falling back
        // to 20 x 3m bars while the series is short.
        let price_change_1h = if klines_1h.len() >= 2 {
            pct_change(klines_1h[klines_1h.len() - 2].close, current_price)
        } else if series.len() >= 21 {
            pct_change(series[series.len() - 21].close, current_price)
        } else {
            0.0
        };
        let price_change_4h = if klines_4h.len() >= 2 {
            pct_change(klines_4h[klines_4h.len() - 2].close, current_price)
        } else if series.len() >= 81 {
            pct_change(series[series.len() - 81].close, current_price)
        } else {
            0.0
        };

        let longer_term = if !klines_4h.is_empty() {
            indicators::longer_term_context(&klines_4h)
        } else {
            // Early in the series there is no full 4h bar yet; approximate
            // from the 3m series so the field stays populated.
            indicators::longer_term_context(series)
        };

        let vol_1h = if !klines_1h.is_empty() {
            indicators::realized_volatility(&klines_1h, 20)
        } else {
            0.0
        };

        MarketSnapshot {
            symbol: symbol.to_string(),
            current_price,
            price_change_1h,
            price_change_4h,
            price_change_day: 0.0,
            current_ema20: indicators::ema(series, 20),
            current_macd: indicators::macd(series),
            current_rsi7: indicators::rsi(series, 7),
            tf_5m: TimeframeIndicators::default(),
            tf_15m: tf(&klines_15m),
            tf_30m: tf(&klines_30m),
            tf_1h: tf(&klines_1h),
            bollinger: indicators::bollinger(series, 20, 2.0),
            funding_rate: 0.0,
            open_interest: None,
            long_short_ratio: None,
            liquidation: None,
            volume: indicators::volume_analysis(series, 20),
            sentiment: Some(Sentiment {
                fear_greed_index: 50,
                fear_greed_label: "Neutral".into(),
                crowding: "Backtest_Unknown".into(),
                volatility_1h: vol_1h,
            }),
            intraday: Some(indicators::intraday_series(series)),
            longer_term: Some(longer_term),
        }
    }

    /// Wall-clock stand-in for trade records: the close time of the last
    /// consumed bar.
    async fn current_bar_time(&self) -> String {
        let state = self.state.read().await;
        let step = state.step.saturating_sub(1);
        self.data
            .values()
            .next()
            .and_then(|series| series.get(step))
            .filter(|k| k.close_time > 0)
            .and_then(|k| chrono::DateTime::from_timestamp_millis(k.close_time))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

fn pct_change(prev: f64, current: f64) -> f64 {
    if prev > 0.0 {
        (current - prev) / prev * 100.0
    } else {
        0.0
    }
}

#[async_trait]
impl Exchange for BacktestExchange {
    async fn refresh_market_data(&self, symbols: &[String]) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        if state.step >= self.max_step {
            return Err(ExchangeError::BacktestFinished);
        }

        for symbol in symbols {
            let series = self
                .data
                .get(symbol)
                .ok_or_else(|| ExchangeError::NoMarketData(symbol.clone()))?;
            if state.step >= series.len() {
                return Err(ExchangeError::BacktestFinished);
            }
            let known = &series[..state.step + 1];
            let snapshot = Self::build_snapshot(symbol, known);
            state.market.insert(symbol.clone(), snapshot);
        }

        let BacktestState {
            paper,
            market,
            step,
        } = &mut *state;
        paper.revalue(market);
        *step += 1;
        debug!(step = *step, of = self.max_step, "backtest step advanced");
        Ok(())
    }

    async fn account(&self) -> Account {
        self.state.read().await.paper.account
    }

    async fn positions(&self) -> Vec<Position> {
        self.state.read().await.paper.sorted_positions()
    }

    async fn market_data(&self) -> BTreeMap<String, MarketSnapshot> {
        self.state.read().await.market.clone()
    }

    async fn execute_decision(&self, d: &Decision) -> Result<(), ExchangeError> {
        let time = self.current_bar_time().await;
        let mut state = self.state.write().await;

        let price = state
            .market
            .get(&d.symbol)
            .map(|m| m.current_price)
            .ok_or_else(|| ExchangeError::NoMarketData(d.symbol.clone()))?;
        if price <= 0.0 {
            return Err(ExchangeError::InvalidPrice(d.symbol.clone()));
        }

        match d.action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => {
                let now_ms = self
                    .data
                    .get(&d.symbol)
                    .and_then(|s| s.get(state.step.saturating_sub(1)))
                    .map(|k| k.close_time)
                    .unwrap_or_default();
                state.paper.open(d, price, now_ms)?;
            }
            DecisionAction::CloseLong | DecisionAction::CloseShort => {
                let expected = if d.action == DecisionAction::CloseLong {
                    Side::Long
                } else {
                    Side::Short
                };
                let fill = state
                    .paper
                    .close(&d.symbol, expected, price, d.action.as_str())?;
                self.history.add(TradeRecord {
                    time: time.clone(),
                    symbol: d.symbol.clone(),
                    side: fill.position.side,
                    action: d.action.to_string(),
                    entry_price: fill.position.entry_price,
                    exit_price: price,
                    quantity: fill.closed_quantity,
                    pnl: fill.pnl,
                    pnl_pct: if fill.position.margin_used > 0.0 {
                        fill.pnl / fill.position.margin_used * 100.0
                    } else {
                        0.0
                    },
                    reason: d.reasoning.clone(),
                });
            }
            DecisionAction::PartialClose => {
                let fill = state.paper.partial_close(d, price)?;
                self.history.add(TradeRecord {
                    time: time.clone(),
                    symbol: d.symbol.clone(),
                    side: fill.position.side,
                    action: "partial_close".into(),
                    entry_price: fill.position.entry_price,
                    exit_price: price,
                    quantity: fill.closed_quantity,
                    pnl: fill.pnl,
                    pnl_pct: fill.position.unrealized_pnl_pct,
                    reason: d.reasoning.clone(),
                });
            }
            // Stop/take updates and waits are ignored in backtests.
            _ => {}
        }

        let BacktestState { paper, market, .. } = &mut *state;
        paper.revalue(market);
        Ok(())
    }

    async fn trade_history(&self) -> Vec<TradeRecord> {
        self.history.history()
    }

    fn name(&self) -> &'static str {
        "backtest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, symbol: &str, bars: usize, start_price: f64) {
        let mut f = std::fs::File::create(dir.join(format!("{symbol}_3m.csv"))).unwrap();
        writeln!(f, "open,high,low,close,volume,taker_buy_volume,close_time_ms").unwrap();
        for i in 0..bars {
            let p = start_price + i as f64;
            writeln!(
                f,
                "{p},{},{},{p},100,60,{}",
                p + 1.0,
                p - 1.0,
                1_700_000_000_000i64 + i as i64 * 180_000
            )
            .unwrap();
        }
    }

    fn history() -> TradeHistoryManager {
        let dir = tempfile::tempdir().unwrap();
        let h = TradeHistoryManager::load(dir.path().join("h.json"));
        std::mem::forget(dir);
        h
    }

    #[test]
    fn csv_loader_skips_header_and_short_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BTCUSDT", 3, 100.0);
        let klines = load_klines_csv(&dir.path().join("BTCUSDT_3m.csv")).unwrap();
        assert_eq!(klines.len(), 3);
        assert_eq!(klines[0].open, 100.0);
        assert_eq!(klines[0].taker_buy_volume, 60.0);
        assert_eq!(klines[2].close, 102.0);
    }

    #[test]
    fn csv_loader_accepts_headerless_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(&path, "100,101,99,100.5,10,6,1700000000000\n").unwrap();
        let klines = load_klines_csv(&path).unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].close, 100.5);
    }

    #[tokio::test]
    async fn refresh_steps_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BTCUSDT", 5, 100.0);
        let symbols = vec!["BTCUSDT".to_string()];
        let ex =
            BacktestExchange::from_csv_dir(1000.0, dir.path(), &symbols, history()).unwrap();
        assert_eq!(ex.total_steps(), 5);

        for _ in 0..5 {
            ex.refresh_market_data(&symbols).await.unwrap();
        }
        let err = ex.refresh_market_data(&symbols).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BacktestFinished));
    }

    #[tokio::test]
    async fn shortest_series_bounds_the_run() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BTCUSDT", 10, 100.0);
        write_csv(dir.path(), "ETHUSDT", 4, 50.0);
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let ex =
            BacktestExchange::from_csv_dir(1000.0, dir.path(), &symbols, history()).unwrap();
        assert_eq!(ex.total_steps(), 4);
    }

    #[tokio::test]
    async fn snapshot_prices_follow_the_series() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BTCUSDT", 30, 100.0);
        let symbols = vec!["BTCUSDT".to_string()];
        let ex =
            BacktestExchange::from_csv_dir(1000.0, dir.path(), &symbols, history()).unwrap();

        ex.refresh_market_data(&symbols).await.unwrap();
        assert_eq!(
            ex.market_data().await["BTCUSDT"].current_price,
            100.0
        );
        ex.refresh_market_data(&symbols).await.unwrap();
        assert_eq!(
            ex.market_data().await["BTCUSDT"].current_price,
            101.0
        );
    }

    #[tokio::test]
    async fn trades_settle_at_bar_prices() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BTCUSDT", 10, 100.0);
        let symbols = vec!["BTCUSDT".to_string()];
        let ex =
            BacktestExchange::from_csv_dir(1000.0, dir.path(), &symbols, history()).unwrap();

        ex.refresh_market_data(&symbols).await.unwrap(); // price 100
        ex.execute_decision(&Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::OpenLong,
            leverage: 10,
            position_size_usd: 500.0,
            ..Default::default()
        })
        .await
        .unwrap();

        ex.refresh_market_data(&symbols).await.unwrap(); // price 101
        ex.execute_decision(&Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::CloseLong,
            ..Default::default()
        })
        .await
        .unwrap();

        let acct = ex.account().await;
        // qty 5, +1 per coin.
        assert!((acct.realized_pnl - 5.0).abs() < 1e-9);
        let record = &ex.trade_history().await[0];
        assert_eq!(record.exit_price, 101.0);
        assert!(record.time.starts_with("2023-"));
    }

    #[tokio::test]
    async fn determinism_identical_inputs_identical_equity() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BTCUSDT", 40, 100.0);
        let symbols = vec!["BTCUSDT".to_string()];

        let mut curves = Vec::new();
        for _ in 0..2 {
            let ex =
                BacktestExchange::from_csv_dir(1000.0, dir.path(), &symbols, history()).unwrap();
            let mut curve = Vec::new();
            ex.refresh_market_data(&symbols).await.unwrap();
            ex.execute_decision(&Decision {
                symbol: "BTCUSDT".into(),
                action: DecisionAction::OpenLong,
                leverage: 10,
                position_size_usd: 500.0,
                ..Default::default()
            })
            .await
            .unwrap();
            while ex.refresh_market_data(&symbols).await.is_ok() {
                curve.push(ex.account().await.total_equity);
            }
            curves.push(curve);
        }
        assert_eq!(curves[0], curves[1]);
    }
}
