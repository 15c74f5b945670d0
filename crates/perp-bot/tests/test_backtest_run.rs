//! Backtest flow tests: CSV replay through the full validation and
//! execution path, and determinism of the resulting equity curve.

use std::io::Write;
use std::path::Path;

use perp_bot::backtest_report::build_report;
use perp_bot::exchange::backtest::BacktestExchange;
use perp_bot::exchange::{Exchange, ExchangeError};
use perp_bot::history::TradeHistoryManager;
use perp_bot::risk::RiskEngine;
use perp_bot::strategy::RiskParams;
use perp_bot::types::{Decision, DecisionAction, TradeRecord};

fn write_series(dir: &Path, symbol: &str, closes: &[f64]) {
    let mut f = std::fs::File::create(dir.join(format!("{symbol}_3m.csv"))).unwrap();
    writeln!(f, "open,high,low,close,volume,taker_buy_volume,close_time_ms").unwrap();
    for (i, c) in closes.iter().enumerate() {
        writeln!(
            f,
            "{c},{},{},{c},250,150,{}",
            c + 0.5,
            c - 0.5,
            1_714_000_000_000i64 + i as i64 * 180_000
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

fn params() -> RiskParams {
    RiskParams {
        max_risk_per_trade: 0.10,
        max_total_risk: 0.40,
        min_risk_reward: 1.0,
        fixed_leverage: 10,
        max_margin_usage: 0.70,
        stop_loss_atr_multiple: 1.5,
    }
}

/// Scripted strategy: long at step 3, close at step 8.
async fn run_scripted(dir: &Path) -> (Vec<f64>, Vec<TradeRecord>) {
    let symbols = vec!["BTCUSDT".to_string()];
    let ex = BacktestExchange::from_csv_dir(1000.0, dir, &symbols, history()).unwrap();
    let engine = RiskEngine::new(params());

    let mut curve = Vec::new();
    let mut step = 0usize;
    loop {
        match ex.refresh_market_data(&symbols).await {
            Ok(()) => {}
            Err(ExchangeError::BacktestFinished) => break,
            Err(e) => panic!("unexpected refresh error: {e}"),
        }
        step += 1;
        curve.push(ex.account().await.total_equity);

        let price = ex.market_data().await["BTCUSDT"].current_price;
        let decision = match step {
            3 => Some(Decision {
                symbol: "BTCUSDT".into(),
                action: DecisionAction::OpenLong,
                leverage: 10,
                position_size_usd: 400.0,
                stop_loss: price * 0.97,
                take_profit: price * 1.06,
                ..Default::default()
            }),
            8 => Some(Decision {
                symbol: "BTCUSDT".into(),
                action: DecisionAction::CloseLong,
                reasoning: "scripted exit".into(),
                ..Default::default()
            }),
            _ => None,
        };

        if let Some(mut d) = decision {
            let account = ex.account().await;
            let market = ex.market_data().await;
            let batch = std::slice::from_mut(&mut d);
            engine.validate_batch(batch, &account, &market).unwrap();
            ex.execute_decision(&d).await.unwrap();
        }
    }

    (curve, ex.trade_history().await)
}

#[tokio::test]
async fn scripted_run_produces_expected_trade() {
    let dir = tempfile::tempdir().unwrap();
    let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.5).collect();
    write_series(dir.path(), "BTCUSDT", &closes);

    let (curve, trades) = run_scripted(dir.path()).await;
    assert_eq!(curve.len(), 20);
    assert_eq!(trades.len(), 1);
    let t = &trades[0];
    assert_eq!(t.action, "close_long");
    // Entered at step 3 (close 101), exited at step 8 (close 103.5).
    assert!((t.entry_price - 101.0).abs() < 1e-9);
    assert!((t.exit_price - 103.5).abs() < 1e-9);
    assert!(t.pnl > 0.0);
    // Equity ends above start by the realized pnl.
    assert!(curve.last().unwrap() > &1000.0);
}

#[tokio::test]
async fn identical_inputs_identical_outputs() {
    let dir = tempfile::tempdir().unwrap();
    // A wavy series so positions carry unrealized swings.
    let closes: Vec<f64> = (0..60)
        .map(|i| 100.0 + ((i % 7) as f64 - 3.0) * 0.8 + i as f64 * 0.1)
        .collect();
    write_series(dir.path(), "BTCUSDT", &closes);

    let (curve_a, trades_a) = run_scripted(dir.path()).await;
    let (curve_b, trades_b) = run_scripted(dir.path()).await;

    assert_eq!(curve_a, curve_b);
    assert_eq!(trades_a.len(), trades_b.len());
    for (a, b) in trades_a.iter().zip(&trades_b) {
        assert_eq!(a, b);
    }
}

#[tokio::test]
async fn report_reflects_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
    write_series(dir.path(), "BTCUSDT", &closes);

    let (curve, trades) = run_scripted(dir.path()).await;
    let report = build_report(1000.0, curve, trades, chrono::Utc::now());
    assert_eq!(report.summary.total_trades, 1);
    assert_eq!(report.summary.winning_trades, 1);
    assert!(report.summary.final_equity > report.summary.initial_capital);
    assert!(report.symbol_stats.contains_key("BTCUSDT"));
}
