//! Prompt assembly for the advisor.
//!
//! The system prompt is the active strategy's prose template plus an
//! auto-generated risk-parameters block, so the advisor always sees the
//! exact limits the risk engine will enforce. The user prompt walks the
//! context: clock, BTC bellwether, account, sector heatmap, held positions
//! (with their market data), then the remaining candidates.

use std::fmt::Write;

use crate::strategy::StrategyManager;
use crate::types::{MarketSnapshot, TradeContext};

/// Price formatting with precision that follows the magnitude, so DOGE and
/// BTC are both readable.
pub fn format_price_dynamic(price: f64) -> String {
    if price < 0.001 {
        format!("{price:.8}")
    } else if price < 0.01 {
        format!("{price:.6}")
    } else if price < 100.0 {
        format!("{price:.4}")
    } else {
        format!("{price:.2}")
    }
}

fn format_series(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format_price_dynamic(*v)).collect();
    format!("[{}]", parts.join(", "))
}

/// Assemble the system prompt from the strategy prose and the enforced
/// risk parameters.
pub fn build_system_prompt(strategies: &StrategyManager) -> String {
    let mut out = strategies.prompt_prose();
    let params = strategies.risk_params();
    let strategy = strategies.active();

    out.push_str("\n\n# Active strategy\n");
    let _ = writeln!(out, "{} ({})", strategy.name, strategy.description);

    out.push_str("\n## Risk parameters (enforced by the backend)\n");
    let _ = writeln!(
        out,
        "- Fixed leverage: {}x (you cannot manage risk via leverage; use position size and stop placement)",
        params.fixed_leverage
    );
    let _ = writeln!(
        out,
        "- Max single-trade risk: {:.0}% of account equity",
        params.max_risk_per_trade * 100.0
    );
    let _ = writeln!(
        out,
        "- Max total risk per cycle: {:.0}% of account equity across all new opens",
        params.max_total_risk * 100.0
    );
    let _ = writeln!(out, "- Minimum reward:risk: {:.1}:1", params.min_risk_reward);
    let _ = writeln!(
        out,
        "- Max margin usage per trade: {:.0}% of available balance",
        params.max_margin_usage * 100.0
    );
    let _ = writeln!(
        out,
        "- Stop-loss distance guide: {:.1}x ATR",
        params.stop_loss_atr_multiple
    );

    out.push_str("\n## Strategy guidance\n");
    out.push_str(strategies.guidance());

    out
}

/// Assemble the user prompt from the composed context.
pub fn build_user_prompt(ctx: &TradeContext) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Time: {} | Runtime: {} min | Cycle: #{}\n",
        ctx.current_time, ctx.runtime_minutes, ctx.cycle
    );

    // BTC bellwether line anchors the regime view.
    if let Some(btc) = ctx.market.get("BTCUSDT") {
        let ls = btc
            .long_short_ratio
            .map(|r| format!(" | LS Ratio: {:.2}", r.ratio))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "BTC: {} (1h: {:+.2}%, 4h: {:+.2}%) | MACD: {:.4} | RSI: {:.2}{}\n",
            format_price_dynamic(btc.current_price),
            btc.price_change_1h,
            btc.price_change_4h,
            btc.current_macd,
            btc.current_rsi7,
            ls
        );
    }

    let acct = &ctx.account;
    let available_pct = if acct.total_equity > 0.0 {
        acct.available_balance / acct.total_equity * 100.0
    } else {
        0.0
    };
    let _ = writeln!(
        out,
        "Account: equity {:.2} | available {:.2} ({:.1}%) | PnL {:+.2}% | margin {:.1}% | positions {}",
        acct.total_equity,
        acct.available_balance,
        available_pct,
        acct.realized_pnl_pct,
        acct.margin_used_pct,
        acct.position_count
    );
    let _ = writeln!(out, "Runtime Sharpe (relative): {:.2}\n", ctx.sharpe_ratio);

    if !ctx.sectors.is_empty() {
        out.push_str("## Sector heatmap (1h/4h change)\n");
        for sec in &ctx.sectors {
            let _ = writeln!(
                out,
                "- {}: 1h {:+.2}% | 4h {:+.2}% | Lead: {}",
                sec.name, sec.avg_change_1h, sec.avg_change_4h, sec.leader
            );
        }
        out.push('\n');
    }

    if ctx.positions.is_empty() {
        out.push_str("Current positions: none\n\n");
    } else {
        out.push_str("## Current positions\n");
        for (i, pos) in ctx.positions.iter().enumerate() {
            let held = holding_duration(ctx, pos.opened_at_ms);
            let _ = writeln!(
                out,
                "{}. {} {} | entry {} now {} | qty {:.4} | value {:.0} | PnL {:+.2} ({:+.2}%) | peak {:.2}% | {}x | liq {}{}\n",
                i + 1,
                pos.symbol,
                pos.side.as_str().to_uppercase(),
                format_price_dynamic(pos.entry_price),
                format_price_dynamic(pos.mark_price),
                pos.quantity,
                pos.notional(),
                pos.unrealized_pnl,
                pos.unrealized_pnl_pct,
                pos.peak_pnl_pct,
                pos.leverage,
                format_price_dynamic(pos.liquidation_price),
                held
            );
            if let Some(md) = ctx.market.get(&pos.symbol) {
                out.push_str(&describe_market(md));
                out.push('\n');
            }
        }
    }

    // Candidates exclude symbols already held.
    let held: std::collections::HashSet<&str> =
        ctx.positions.iter().map(|p| p.symbol.as_str()).collect();
    let candidates: Vec<&MarketSnapshot> = ctx
        .market
        .values()
        .filter(|m| !held.contains(m.symbol.as_str()))
        .collect();

    let _ = writeln!(out, "## Candidates ({})\n", candidates.len());
    for (i, md) in candidates.iter().enumerate() {
        let _ = writeln!(out, "### {}. {}", i + 1, md.symbol);
        out.push_str(&describe_market(md));
        out.push('\n');
    }

    out.push_str("---\nAnalyse and output your decisions.\n");
    out
}

fn holding_duration(ctx: &TradeContext, opened_at_ms: i64) -> String {
    if opened_at_ms <= 0 {
        return String::new();
    }
    // Parse the context clock back rather than reading the wall clock, so
    // prompts are a pure function of the context.
    let now_ms = chrono::NaiveDateTime::parse_from_str(&ctx.current_time, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc().timestamp_millis())
        .unwrap_or(opened_at_ms);
    let minutes = (now_ms - opened_at_ms).max(0) / 60_000;
    if minutes < 60 {
        format!(" | held {minutes}m")
    } else {
        format!(" | held {}h{}m", minutes / 60, minutes % 60)
    }
}

/// One symbol's market description, shared between the positions and the
/// candidates sections.
pub fn describe_market(md: &MarketSnapshot) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "current_price = {}, current_ema20 = {:.3}, current_macd = {:.3}, current_rsi (7 period) = {:.3}",
        format_price_dynamic(md.current_price),
        md.current_ema20,
        md.current_macd,
        md.current_rsi7
    );
    let _ = writeln!(
        out,
        "Bollinger Bands (20, 2.0): Upper={}, Mid={}, Lower={}\n",
        format_price_dynamic(md.bollinger.upper),
        format_price_dynamic(md.bollinger.middle),
        format_price_dynamic(md.bollinger.lower)
    );

    let _ = writeln!(
        out,
        "Latest {} perp positioning and funding:\n",
        md.symbol
    );
    if let Some(ls) = &md.long_short_ratio {
        let _ = writeln!(
            out,
            "Top Trader LS Ratio: {:.2} (Longs: {:.1}%, Shorts: {:.1}%)",
            ls.ratio,
            ls.long_pct * 100.0,
            ls.short_pct * 100.0
        );
    }
    if let Some(liq) = &md.liquidation {
        let _ = writeln!(
            out,
            "Estimated Liquidation (1h): ${:.0} (Side Ratio: {:.1}, >1 means longs liquidated)",
            liq.amount_1h, liq.side_ratio
        );
    }
    if let Some(oi) = &md.open_interest {
        let _ = writeln!(
            out,
            "Open Interest: Latest: {} Average: {} (1h Chg: {:+.2}%, 4h Chg: {:+.2}%)\n",
            format_price_dynamic(oi.latest),
            format_price_dynamic(oi.average),
            oi.change_1h,
            oi.change_4h
        );
    }
    let _ = writeln!(out, "Funding Rate: {:.2e}\n", md.funding_rate);

    if let Some(va) = &md.volume {
        out.push_str("Volume & Flow: ");
        if va.relative_volume_3m > 0.0 {
            let _ = write!(out, "3m relative volume = {:.2}x avg", va.relative_volume_3m);
        }
        if va.is_volume_spike {
            out.push_str(" (VOLUME SPIKE)");
        }
        if va.taker_buy_sell_ratio != 0.0 {
            let _ = write!(
                out,
                ", taker buy/sell ratio = {:.2} (>1 = aggressive buying)",
                va.taker_buy_sell_ratio
            );
        }
        out.push_str("\n\n");
    }

    if let Some(st) = &md.sentiment {
        if !st.fear_greed_label.is_empty() {
            let _ = writeln!(
                out,
                "Local Fear/Greed: {} ({}/100)",
                st.fear_greed_label, st.fear_greed_index
            );
        }
        if !st.crowding.is_empty() {
            let _ = writeln!(out, "Local Sentiment Tag: {}", st.crowding);
        }
        if st.volatility_1h > 0.0 {
            let _ = writeln!(out, "1h Realized Vol (approx): {:.4}", st.volatility_1h);
        }
        out.push('\n');
    }

    if let Some(intra) = &md.intraday {
        out.push_str("Micro-structure (3m) for timing only (ignore noise):\n");
        if !intra.mid_prices.is_empty() {
            let _ = writeln!(out, "Mid prices: {}", format_series(&intra.mid_prices));
        }
        out.push('\n');
    }

    if md.tf_30m.is_populated() {
        out.push_str("Intraday wave context (30-minute timeframe):\n");
        let _ = writeln!(
            out,
            "EMA20 (30m): {:.3} | MACD (30m): {:.3} | RSI14 (30m): {:.3} | ATR14 (30m): {:.3}\n",
            md.tf_30m.ema20, md.tf_30m.macd, md.tf_30m.rsi14, md.tf_30m.atr14
        );
    }
    if md.tf_1h.is_populated() {
        out.push_str("Mid-term context (1-hour timeframe):\n");
        let _ = writeln!(
            out,
            "EMA20 (1h): {:.3} | MACD (1h): {:.3} | RSI14 (1h): {:.3} | ATR14 (1h): {:.3}\n",
            md.tf_1h.ema20, md.tf_1h.macd, md.tf_1h.rsi14, md.tf_1h.atr14
        );
    }

    if let Some(lt) = &md.longer_term {
        out.push_str("Longer-term context (4-hour timeframe):\n\n");
        let _ = writeln!(
            out,
            "20-Period EMA: {:.3} vs. 50-Period EMA: {:.3}\n",
            lt.ema20, lt.ema50
        );
        let _ = writeln!(
            out,
            "3-Period ATR: {:.3} vs. 14-Period ATR: {:.3}\n",
            lt.atr3, lt.atr14
        );
        let _ = writeln!(
            out,
            "Current Volume: {:.3} vs. Average Volume: {:.3}\n",
            lt.current_volume, lt.average_volume
        );
        if !lt.macd.is_empty() {
            let _ = writeln!(out, "MACD indicators: {}\n", format_series(&lt.macd));
        }
        if !lt.rsi14.is_empty() {
            let _ = writeln!(
                out,
                "RSI indicators (14-Period): {}\n",
                format_series(&lt.rsi14)
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyManager;
    use crate::types::{Account, Position, TradeContext};
    use perp_common::Side;
    use std::collections::BTreeMap;

    #[test]
    fn dynamic_precision_scales_with_magnitude() {
        assert_eq!(format_price_dynamic(0.00001234), "0.00001234");
        assert_eq!(format_price_dynamic(0.005), "0.005000");
        assert_eq!(format_price_dynamic(1.5), "1.5000");
        assert_eq!(format_price_dynamic(64321.5), "64321.50");
    }

    #[test]
    fn system_prompt_embeds_risk_parameters() {
        let sm = StrategyManager::new("/nonexistent");
        let prompt = build_system_prompt(&sm);
        assert!(prompt.contains("Fixed leverage: 15x"));
        assert!(prompt.contains("Max single-trade risk: 25%"));
        assert!(prompt.contains("balanced"));
    }

    fn sample_context() -> TradeContext {
        let mut market = BTreeMap::new();
        market.insert(
            "BTCUSDT".to_string(),
            MarketSnapshot {
                symbol: "BTCUSDT".into(),
                current_price: 64_000.0,
                price_change_1h: 1.2,
                price_change_4h: -0.4,
                current_macd: 12.0,
                current_rsi7: 55.0,
                ..Default::default()
            },
        );
        market.insert(
            "ETHUSDT".to_string(),
            MarketSnapshot {
                symbol: "ETHUSDT".into(),
                current_price: 3000.0,
                ..Default::default()
            },
        );
        TradeContext {
            current_time: "2024-06-01 12:00:00".into(),
            runtime_minutes: 30,
            cycle: 3,
            account: Account {
                total_equity: 1000.0,
                available_balance: 800.0,
                position_count: 1,
                ..Default::default()
            },
            positions: vec![Position {
                symbol: "ETHUSDT".into(),
                side: Side::Long,
                entry_price: 2900.0,
                mark_price: 3000.0,
                quantity: 0.5,
                leverage: 10,
                unrealized_pnl: 50.0,
                unrealized_pnl_pct: 34.5,
                peak_pnl_pct: 40.0,
                liquidation_price: 2610.0,
                margin_used: 145.0,
                opened_at_ms: 1717236000000, // 2024-06-01 10:00:00 UTC
            }],
            market,
            sectors: vec![],
            sharpe_ratio: 1.5,
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
        }
    }

    #[test]
    fn user_prompt_has_bellwether_and_sections() {
        let prompt = build_user_prompt(&sample_context());
        assert!(prompt.starts_with("Time: 2024-06-01 12:00:00"));
        assert!(prompt.contains("BTC: 64000.00"));
        assert!(prompt.contains("## Current positions"));
        assert!(prompt.contains("ETHUSDT LONG"));
        // Held for two hours per the context clock.
        assert!(prompt.contains("held 2h0m"), "prompt: {prompt}");
        // ETH is held, so only BTC remains a candidate.
        assert!(prompt.contains("## Candidates (1)"));
        assert!(prompt.contains("### 1. BTCUSDT"));
    }

    #[test]
    fn user_prompt_without_positions() {
        let mut ctx = sample_context();
        ctx.positions.clear();
        ctx.account.position_count = 0;
        let prompt = build_user_prompt(&ctx);
        assert!(prompt.contains("Current positions: none"));
        assert!(prompt.contains("## Candidates (2)"));
    }
}
