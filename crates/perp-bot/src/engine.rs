//! The periodic control loop.
//!
//! One cycle: refresh market data, read account and positions, run the
//! hard stop-loss sweep, build the context, consult the advisor, normalize
//! and risk-validate the decisions, execute them, push everything to the
//! dashboard, and persist artifacts. Cycles never overlap; a slow advisor
//! defers the next cycle.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::Duration;
use tracing::{error, info, warn};

use perp_common::{is_major, Side};

use crate::advisor::AdvisorClient;
use crate::clock::Clock;
use crate::context::{build_context, ContextInputs};
use crate::cycle_log::CycleLog;
use crate::dashboard::DashboardState;
use crate::exchange::{Exchange, ExchangeError};
use crate::normalize::{apply_defensive_mode, normalize_decisions};
use crate::risk::RiskEngine;
use crate::storage::Storage;
use crate::strategy::StrategyManager;
use crate::types::{Decision, DecisionAction, ExecStatus, Position, TradeContext};

/// Forced-close thresholds on unrealized PnL percent of margin.
const HARD_STOP_MAJOR_PCT: f64 = -30.0;
const HARD_STOP_ALTCOIN_PCT: f64 = -25.0;

/// Back-off after a failed refresh or advisor call.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

enum CycleOutcome {
    /// Sleep the configured interval, then run the next cycle.
    Continue,
    /// Short back-off, then retry.
    Backoff,
    /// Backtest data exhausted; stop cleanly.
    Finished,
}

/// Close every position whose loss has breached its class threshold.
/// Returns the symbols that were swept. Failures are logged, not retried
/// within the cycle; the exchange is re-read afterwards anyway.
pub async fn hard_stop_sweep(exchange: &dyn Exchange, positions: &[Position]) -> Vec<String> {
    let mut swept = Vec::new();
    for p in positions {
        let threshold = if is_major(&p.symbol) {
            HARD_STOP_MAJOR_PCT
        } else {
            HARD_STOP_ALTCOIN_PCT
        };
        if p.unrealized_pnl_pct > threshold {
            continue;
        }

        warn!(
            symbol = %p.symbol,
            side = %p.side,
            pnl_pct = p.unrealized_pnl_pct,
            threshold,
            "hard stop-loss sweep closing position"
        );
        let decision = Decision {
            symbol: p.symbol.clone(),
            action: match p.side {
                Side::Long => DecisionAction::CloseLong,
                Side::Short => DecisionAction::CloseShort,
            },
            reasoning: format!(
                "hard stop-loss sweep: unrealized {:.2}% <= {:.0}%",
                p.unrealized_pnl_pct, threshold
            ),
            ..Default::default()
        };
        match exchange.execute_decision(&decision).await {
            Ok(()) => swept.push(p.symbol.clone()),
            Err(e) => error!(symbol = %p.symbol, error = %e, "sweep close failed"),
        }
    }
    swept
}

pub struct TraderEngine {
    exchange: Arc<dyn Exchange>,
    advisor: AdvisorClient,
    strategies: StrategyManager,
    dashboard: Arc<DashboardState>,
    storage: Arc<Storage>,
    cycle_log: CycleLog,
    clock: Arc<dyn Clock>,

    symbols: Vec<String>,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
    /// False in backtests: no sleeping between cycles.
    paced: bool,

    started_at: DateTime<Utc>,
    cycle: u64,
    equity_curve: Vec<f64>,
    peak_equity: f64,
    persisted_trades: HashSet<String>,
}

impl TraderEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        advisor: AdvisorClient,
        strategies: StrategyManager,
        dashboard: Arc<DashboardState>,
        storage: Arc<Storage>,
        cycle_log: CycleLog,
        clock: Arc<dyn Clock>,
        symbols: Vec<String>,
        btc_eth_leverage: u32,
        altcoin_leverage: u32,
        paced: bool,
    ) -> Self {
        let started_at = clock.now();
        Self {
            exchange,
            advisor,
            strategies,
            dashboard,
            storage,
            cycle_log,
            clock,
            symbols,
            btc_eth_leverage,
            altcoin_leverage,
            paced,
            started_at,
            cycle: 0,
            equity_curve: Vec::new(),
            peak_equity: 0.0,
            persisted_trades: HashSet::new(),
        }
    }

    /// Run until killed (live/simulated) or the data ends (backtest).
    /// Returns the equity curve for report generation.
    pub async fn run(mut self) -> Result<Vec<f64>> {
        info!(
            exchange = self.exchange.name(),
            symbols = ?self.symbols,
            strategy = self.strategies.active_name(),
            "control loop starting"
        );

        loop {
            self.cycle += 1;
            match self.run_cycle().await {
                CycleOutcome::Continue => {
                    if self.paced {
                        let secs = self.dashboard.loop_interval_secs().await.max(1);
                        info!(seconds = secs, "cycle complete, sleeping");
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    }
                }
                CycleOutcome::Backoff => {
                    if self.paced {
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                CycleOutcome::Finished => {
                    info!(cycles = self.cycle, "backtest data exhausted, stopping");
                    return Ok(self.equity_curve);
                }
            }
        }
    }

    async fn run_cycle(&mut self) -> CycleOutcome {
        info!(cycle = self.cycle, "cycle start");

        // 1. Market data.
        if let Err(e) = self.exchange.refresh_market_data(&self.symbols).await {
            if matches!(e, ExchangeError::BacktestFinished) {
                return CycleOutcome::Finished;
            }
            warn!(error = %e, "market refresh failed");
            return CycleOutcome::Backoff;
        }

        // 2. Account, peak equity, drawdown.
        let account = self.exchange.account().await;
        if account.total_equity > self.peak_equity {
            self.peak_equity = account.total_equity;
        }
        let drawdown = if self.peak_equity > 0.0 {
            (self.peak_equity - account.total_equity) / self.peak_equity
        } else {
            0.0
        };
        self.equity_curve.push(account.total_equity);

        // 3. Positions and the hard stop-loss sweep.
        let mut positions = self.exchange.positions().await;
        let swept = hard_stop_sweep(self.exchange.as_ref(), &positions).await;
        if !swept.is_empty() {
            positions = self.exchange.positions().await;
        }

        // 4. Context and advisor.
        let market = self.exchange.market_data().await;
        let ctx = build_context(ContextInputs {
            now: self.clock.now(),
            started_at: self.started_at,
            cycle: self.cycle,
            account,
            positions: positions.clone(),
            market,
            equity_curve: self.equity_curve.clone(),
            btc_eth_leverage: self.btc_eth_leverage,
            altcoin_leverage: self.altcoin_leverage,
        });

        let mut note = if swept.is_empty() {
            String::new()
        } else {
            format!("hard stop sweep closed: {}", swept.join(", "))
        };

        let mut full_decision = match self.advisor.get_decision(&ctx, &self.strategies).await {
            Ok(fd) => fd,
            Err(e) => {
                error!(error = %e, "advisor call failed");
                self.dashboard.update(&ctx, None, &ctx.market).await;
                if !note.is_empty() {
                    note.push_str("; ");
                }
                note.push_str(&format!("advisor error: {e}"));
                self.cycle_log.append(&ctx, None, &note);
                return CycleOutcome::Backoff;
            }
        };

        // 5. Normalize and defensive mode.
        normalize_decisions(&mut full_decision.decisions, &positions);
        if drawdown >= crate::normalize::DEFENSIVE_DRAWDOWN {
            warn!(
                drawdown_pct = drawdown * 100.0,
                "defensive mode active, suppressing new opens"
            );
        }
        apply_defensive_mode(&mut full_decision.decisions, drawdown);

        // 6. Pre-execution dashboard push.
        self.dashboard
            .update(&ctx, Some(&full_decision), &ctx.market)
            .await;

        // 7. Risk validation: a rejection skips execution for the cycle.
        let engine = RiskEngine::new(self.strategies.risk_params());
        let validated = engine.validate_batch(
            &mut full_decision.decisions,
            &ctx.account,
            &ctx.market,
        );

        match validated {
            Ok(()) => {
                // 8. Execute one by one, stamping outcomes.
                for d in full_decision.decisions.iter_mut() {
                    if matches!(d.action, DecisionAction::Hold | DecisionAction::Wait) {
                        d.exec_status = Some(ExecStatus::Skipped);
                        continue;
                    }
                    if d.action.is_open() {
                        info!(
                            symbol = %d.symbol,
                            action = %d.action,
                            notional = d.position_size_usd,
                            leverage = d.leverage,
                            est_risk_usd = d.risk_usd,
                            "executing open"
                        );
                    }
                    match self.exchange.execute_decision(d).await {
                        Ok(()) => {
                            d.exec_status = Some(ExecStatus::Success);
                            d.exec_error = None;
                        }
                        Err(e) => {
                            error!(symbol = %d.symbol, action = %d.action, error = %e, "execution failed");
                            d.exec_status = Some(ExecStatus::Failed);
                            d.exec_error = Some(e.to_string());
                        }
                    }
                }

                // Post-execution housekeeping: no stale protective orders
                // for flat symbols.
                self.exchange.cleanup_protective_orders(&self.symbols).await;
            }
            Err(e) => {
                error!(error = %e, "risk validation rejected the batch, skipping execution");
                // Surface the rejection on the dashboard via the statuses.
                for (i, d) in full_decision.decisions.iter_mut().enumerate() {
                    if i == e.index {
                        d.exec_status = Some(ExecStatus::Failed);
                        d.exec_error = Some(e.reason.to_string());
                    } else {
                        d.exec_status = Some(ExecStatus::Skipped);
                        d.exec_error = Some("batch rejected by risk validation".into());
                    }
                }
                if !note.is_empty() {
                    note.push_str("; ");
                }
                note.push_str(&format!("risk rejection: {e}"));
            }
        }

        // 9. Post-execution dashboard push (now with statuses).
        self.dashboard
            .update(&ctx, Some(&full_decision), &ctx.market)
            .await;

        // 10. Persist artifacts, best effort.
        self.persist_cycle(&ctx, &full_decision, &note).await;

        CycleOutcome::Continue
    }

    async fn persist_cycle(
        &mut self,
        ctx: &TradeContext,
        full_decision: &crate::types::FullDecision,
        note: &str,
    ) {
        let acct = &ctx.account;
        if let Err(e) = self.storage.save_equity_snapshot(
            self.clock.now(),
            acct.total_equity,
            acct.realized_pnl,
            acct.realized_pnl_pct,
        ) {
            warn!(error = %e, "equity snapshot save failed");
        }

        if !full_decision.decisions.is_empty() {
            if let Err(e) = self.storage.save_decision(full_decision) {
                warn!(error = %e, "decision record save failed");
            }
        }

        for record in self.exchange.trade_history().await {
            let key = format!(
                "{}|{}|{}|{}|{:.8}|{:.8}",
                record.time, record.symbol, record.side, record.action, record.quantity, record.pnl
            );
            if self.persisted_trades.insert(key) {
                if let Err(e) = self.storage.save_trade_record(record) {
                    warn!(error = %e, "trade record save failed");
                }
            }
        }

        self.cycle_log.append(ctx, Some(full_decision), note);
    }
}
