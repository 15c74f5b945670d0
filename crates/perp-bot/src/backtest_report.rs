//! Backtest summary statistics and the JSON report artifact.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::types::TradeRecord;

/// Trading-days annualization factor for the report-level ratios. The
/// advisor-facing runtime Sharpe stays un-annualized; this one is an
/// offline artifact.
const ANNUALIZATION: f64 = 252.0;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BacktestSummary {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub total_return_usd: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_usd: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub total_trades: usize,
    pub win_rate_pct: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

#[derive(Debug, Serialize)]
pub struct BacktestReport {
    pub summary: BacktestSummary,
    pub equity_curve: Vec<f64>,
    pub trades: Vec<TradeRecord>,
    pub symbol_stats: HashMap<String, SymbolStats>,
    pub generated_at: DateTime<Utc>,
}

fn returns_of(curve: &[f64]) -> Vec<f64> {
    curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

fn annualized_sharpe(curve: &[f64]) -> f64 {
    let returns = returns_of(curve);
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var =
        returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / returns.len() as f64;
    let sd = var.sqrt();
    if sd == 0.0 {
        return 0.0;
    }
    mean / sd * ANNUALIZATION.sqrt()
}

fn annualized_sortino(curve: &[f64]) -> f64 {
    let returns = returns_of(curve);
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if returns.is_empty() || downside.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let down_var = downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64;
    let dd = down_var.sqrt();
    if dd == 0.0 {
        return 0.0;
    }
    mean / dd * ANNUALIZATION.sqrt()
}

/// Build the full report from the run's equity curve and trade records.
pub fn build_report(
    initial_capital: f64,
    equity_curve: Vec<f64>,
    trades: Vec<TradeRecord>,
    generated_at: DateTime<Utc>,
) -> BacktestReport {
    let mut summary = BacktestSummary {
        initial_capital,
        total_trades: trades.len(),
        ..Default::default()
    };

    if let Some(last) = equity_curve.last() {
        summary.final_equity = *last;
        summary.total_return_usd = last - initial_capital;
        if initial_capital > 0.0 {
            summary.total_return_pct = summary.total_return_usd / initial_capital * 100.0;
        }
    }

    // Max drawdown against the running peak.
    let mut peak = f64::MIN;
    for &equity in &equity_curve {
        peak = peak.max(equity);
        if peak > 0.0 {
            let dd_usd = peak - equity;
            let dd_pct = dd_usd / peak * 100.0;
            if dd_pct > summary.max_drawdown_pct {
                summary.max_drawdown_pct = dd_pct;
                summary.max_drawdown_usd = dd_usd;
            }
        }
    }

    let mut total_win = 0.0;
    let mut total_loss = 0.0;
    for t in &trades {
        if t.pnl > 0.0 {
            summary.winning_trades += 1;
            total_win += t.pnl;
            summary.largest_win = summary.largest_win.max(t.pnl);
        } else if t.pnl < 0.0 {
            summary.losing_trades += 1;
            total_loss += t.pnl.abs();
            summary.largest_loss = summary.largest_loss.min(t.pnl);
        }
    }
    if summary.total_trades > 0 {
        summary.win_rate_pct =
            summary.winning_trades as f64 / summary.total_trades as f64 * 100.0;
    }
    if summary.winning_trades > 0 {
        summary.avg_win = total_win / summary.winning_trades as f64;
    }
    if summary.losing_trades > 0 {
        summary.avg_loss = total_loss / summary.losing_trades as f64;
    }
    if total_loss > 0.0 {
        summary.profit_factor = total_win / total_loss;
    }

    summary.sharpe_ratio = annualized_sharpe(&equity_curve);
    summary.sortino_ratio = annualized_sortino(&equity_curve);

    let mut symbol_stats: HashMap<String, SymbolStats> = HashMap::new();
    for t in &trades {
        let s = symbol_stats
            .entry(t.symbol.clone())
            .or_insert_with(|| SymbolStats {
                symbol: t.symbol.clone(),
                ..Default::default()
            });
        s.total_trades += 1;
        s.total_pnl += t.pnl;
        if t.pnl > 0.0 {
            s.largest_win = s.largest_win.max(t.pnl);
        } else {
            s.largest_loss = s.largest_loss.min(t.pnl);
        }
    }
    for s in symbol_stats.values_mut() {
        if s.total_trades > 0 {
            s.avg_pnl = s.total_pnl / s.total_trades as f64;
            let wins = trades
                .iter()
                .filter(|t| t.symbol == s.symbol && t.pnl > 0.0)
                .count();
            s.win_rate_pct = wins as f64 / s.total_trades as f64 * 100.0;
        }
    }

    BacktestReport {
        summary,
        equity_curve,
        trades,
        symbol_stats,
        generated_at,
    }
}

/// Write the report as pretty JSON under `output_dir`.
pub fn save_report(report: &BacktestReport, output_dir: &Path) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("create report dir {}", output_dir.display()))?;
    let name = format!(
        "report_{}.json",
        report.generated_at.format("%Y%m%d_%H%M%S")
    );
    let path = output_dir.join(name);
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
    info!(path = %path.display(), "backtest report saved");
    Ok(path)
}
