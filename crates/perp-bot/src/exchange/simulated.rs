//! In-memory simulated exchange.
//!
//! Prices follow a trivial deterministic drift (a placeholder, not a market
//! model); fills are instant at the current price via the shared paper
//! engine, so the equity identity `equity = available + margin +
//! unrealized` holds after every operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use perp_common::Side;

use crate::clock::Clock;
use crate::history::TradeHistoryManager;
use crate::types::{Account, Decision, DecisionAction, MarketSnapshot, Position, TradeRecord};

use super::paper::PaperEngine;
use super::{Exchange, ExchangeError};

const INITIAL_PRICE: f64 = 100.0;
const PRICE_DRIFT: f64 = 0.1;

struct SimState {
    paper: PaperEngine,
    market: BTreeMap<String, MarketSnapshot>,
}

/// Simulated exchange over a deterministic price drift.
pub struct SimulatedExchange {
    state: RwLock<SimState>,
    history: TradeHistoryManager,
    clock: Arc<dyn Clock>,
}

impl SimulatedExchange {
    pub fn new(
        initial_capital: f64,
        history: TradeHistoryManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: RwLock::new(SimState {
                paper: PaperEngine::new(initial_capital),
                market: BTreeMap::new(),
            }),
            history,
            clock,
        }
    }

    fn record_close(&self, d: &Decision, fill: &super::paper::CloseFill, price: f64) {
        let pos = &fill.position;
        self.history.add(TradeRecord {
            time: self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string(),
            symbol: d.symbol.clone(),
            side: pos.side,
            action: if fill.percentage < 100.0 {
                "partial_close".to_string()
            } else {
                d.action.to_string()
            },
            entry_price: pos.entry_price,
            exit_price: price,
            quantity: fill.closed_quantity,
            pnl: fill.pnl,
            pnl_pct: if pos.margin_used > 0.0 {
                fill.pnl / (pos.margin_used * fill.percentage / 100.0) * 100.0
            } else {
                0.0
            },
            reason: d.reasoning.clone(),
        });
    }
}

#[async_trait]
impl Exchange for SimulatedExchange {
    async fn refresh_market_data(&self, symbols: &[String]) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        for symbol in symbols {
            let md = state
                .market
                .entry(symbol.clone())
                .or_insert_with(|| MarketSnapshot {
                    symbol: symbol.clone(),
                    ..Default::default()
                });
            if md.current_price == 0.0 {
                md.current_price = INITIAL_PRICE;
            } else {
                md.current_price += PRICE_DRIFT;
            }
        }
        let SimState { paper, market } = &mut *state;
        paper.revalue(market);
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
                state.paper.open(d, price, self.clock.now_ms())?;
                info!(
                    symbol = %d.symbol,
                    action = %d.action,
                    notional = d.position_size_usd,
                    price,
                    "simulated open"
                );
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
                self.record_close(d, &fill, price);
                info!(symbol = %d.symbol, pnl = fill.pnl, "simulated close");
            }
            DecisionAction::PartialClose => {
                let fill = state.paper.partial_close(d, price)?;
                if fill.percentage < 100.0 && d.close_percentage <= 0.0 {
                    info!(
                        symbol = %d.symbol,
                        derived_pct = fill.percentage,
                        "[Partial Fallback] close percentage derived from notional"
                    );
                }
                self.record_close(d, &fill, price);
                info!(
                    symbol = %d.symbol,
                    pct = fill.percentage,
                    pnl = fill.pnl,
                    "simulated partial close"
                );
            }
            DecisionAction::UpdateStopLoss | DecisionAction::UpdateTakeProfit => {
                // Protective levels are managed programmatically in
                // simulation; accept and move on.
                debug!(symbol = %d.symbol, action = %d.action, "accepted without order placement");
            }
            _ => {}
        }

        let SimState { paper, market } = &mut *state;
        paper.revalue(market);
        Ok(())
    }

    async fn trade_history(&self) -> Vec<TradeRecord> {
        self.history.history()
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    const EPS: f64 = 1e-9;

    fn exchange() -> SimulatedExchange {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistoryManager::load(dir.path().join("history.json"));
        // Keep the directory alive for the test process lifetime.
        std::mem::forget(dir);
        let clock = Arc::new(FixedClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        SimulatedExchange::new(1000.0, history, clock)
    }

    fn open(symbol: &str, action: DecisionAction, notional: f64, leverage: u32) -> Decision {
        Decision {
            symbol: symbol.into(),
            action,
            leverage,
            position_size_usd: notional,
            ..Default::default()
        }
    }

    async fn equity_identity_holds(ex: &SimulatedExchange) {
        let acct = ex.account().await;
        assert!(
            (acct.total_equity - (acct.available_balance + acct.margin_used + acct.unrealized_pnl))
                .abs()
                < EPS,
            "equity identity broken: {acct:?}"
        );
    }

    #[tokio::test]
    async fn open_reserves_margin() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap();

        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 500.0, 10))
            .await
            .unwrap();

        let acct = ex.account().await;
        assert!((acct.available_balance - 950.0).abs() < EPS);
        assert!((acct.margin_used - 50.0).abs() < EPS);
        assert_eq!(acct.position_count, 1);
        equity_identity_holds(&ex).await;

        let positions = ex.positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
        assert!((positions[0].quantity - 5.0).abs() < EPS);
    }

    #[tokio::test]
    async fn insufficient_balance_rejects_open() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap();
        let err = ex
            .execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 50_000.0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn addition_uses_weighted_average_entry() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap(); // price 100
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 100.0, 10))
            .await
            .unwrap(); // qty 1 @ 100
        ex.refresh_market_data(&symbols).await.unwrap(); // price 100.1
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 100.1, 10))
            .await
            .unwrap(); // qty 1 @ 100.1

        let positions = ex.positions().await;
        assert_eq!(positions.len(), 1);
        assert!((positions[0].quantity - 2.0).abs() < EPS);
        assert!((positions[0].entry_price - 100.05).abs() < EPS);
        assert!((positions[0].margin_used - 20.01).abs() < 1e-6);
        equity_identity_holds(&ex).await;
    }

    #[tokio::test]
    async fn opposite_side_open_conflicts() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap();
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 100.0, 10))
            .await
            .unwrap();
        let err = ex
            .execute_decision(&open("BTCUSDT", DecisionAction::OpenShort, 100.0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PositionConflict { .. }));
    }

    #[tokio::test]
    async fn close_returns_margin_plus_pnl() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap(); // 100
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 1000.0, 10))
            .await
            .unwrap(); // qty 10, margin 100
        ex.refresh_market_data(&symbols).await.unwrap(); // 100.1

        let close = Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::CloseLong,
            reasoning: "take the drift".into(),
            ..Default::default()
        };
        ex.execute_decision(&close).await.unwrap();

        let acct = ex.account().await;
        // PnL = 0.1 x 10 = 1.
        assert!((acct.available_balance - 1001.0).abs() < EPS);
        assert_eq!(acct.position_count, 0);
        assert!((acct.realized_pnl - 1.0).abs() < EPS);
        equity_identity_holds(&ex).await;

        let history = ex.trade_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "close_long");
        assert!((history[0].pnl - 1.0).abs() < EPS);
    }

    #[tokio::test]
    async fn close_wrong_side_is_rejected() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap();
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenShort, 100.0, 10))
            .await
            .unwrap();
        let close = Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::CloseLong,
            ..Default::default()
        };
        assert!(ex.execute_decision(&close).await.is_err());
    }

    #[tokio::test]
    async fn partial_close_conserves_value() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap(); // 100
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 1000.0, 10))
            .await
            .unwrap(); // qty 10, margin 100
        ex.refresh_market_data(&symbols).await.unwrap(); // 100.1, pnl 1

        let before = ex.account().await;
        let pos_before = ex.positions().await[0].clone();

        let partial = Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::PartialClose,
            close_percentage: 40.0,
            ..Default::default()
        };
        ex.execute_decision(&partial).await.unwrap();

        let pos = ex.positions().await[0].clone();
        assert!((pos.quantity - pos_before.quantity * 0.6).abs() < EPS);
        assert!((pos.margin_used - pos_before.margin_used * 0.6).abs() < EPS);

        let after = ex.account().await;
        // Available grew by pct x (margin + pnl).
        let expected_credit = pos_before.margin_used * 0.4 + pos_before.unrealized_pnl * 0.4;
        assert!(
            (after.available_balance - before.available_balance - expected_credit).abs() < 1e-6
        );
        equity_identity_holds(&ex).await;
    }

    #[tokio::test]
    async fn partial_close_derives_pct_from_notional() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap();
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 1000.0, 10))
            .await
            .unwrap(); // qty 10 @ 100

        let partial = Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::PartialClose,
            position_size_usd: 500.0, // half the notional
            ..Default::default()
        };
        ex.execute_decision(&partial).await.unwrap();
        let pos = &ex.positions().await[0];
        assert!((pos.quantity - 5.0).abs() < EPS);
    }

    #[tokio::test]
    async fn near_full_partial_close_removes_position() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap();
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 1000.0, 10))
            .await
            .unwrap();

        let partial = Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::PartialClose,
            close_percentage: 99.95,
            ..Default::default()
        };
        ex.execute_decision(&partial).await.unwrap();
        assert!(ex.positions().await.is_empty());
        equity_identity_holds(&ex).await;
    }

    #[tokio::test]
    async fn short_pnl_is_inverted() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap(); // 100
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenShort, 1000.0, 10))
            .await
            .unwrap();
        ex.refresh_market_data(&symbols).await.unwrap(); // 100.1 against us

        let positions = ex.positions().await;
        assert!(positions[0].unrealized_pnl < 0.0);
        equity_identity_holds(&ex).await;
    }

    #[tokio::test]
    async fn peak_pnl_tracks_high_water_mark() {
        let ex = exchange();
        let symbols = vec!["BTCUSDT".to_string()];
        ex.refresh_market_data(&symbols).await.unwrap(); // 100
        ex.execute_decision(&open("BTCUSDT", DecisionAction::OpenLong, 1000.0, 10))
            .await
            .unwrap();
        ex.refresh_market_data(&symbols).await.unwrap(); // 100.1
        ex.refresh_market_data(&symbols).await.unwrap(); // 100.2

        let peak = ex.positions().await[0].peak_pnl_pct;
        assert!(peak > 0.0);
        // Peak never decreases while the position lives.
        let again = ex.positions().await[0].peak_pnl_pct;
        assert!(again >= peak);
    }
}
