//! Per-cycle context assembly: runtime Sharpe, sector heatmap, and the
//! composed `TradeContext` handed to the advisor and the dashboard.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{Account, MarketSnapshot, Position, Sector, TradeContext};

/// Running Sharpe over the appended equity series: mean/sigma of per-cycle
/// simple returns, no annualization. The advisor reads it as a relative
/// signal, so the scale is deliberate and must not change.
///
/// Degenerate cases: fewer than three points, or no usable returns, yield
/// 0.0; zero volatility with positive mean yields 10.0.
pub fn runtime_sharpe(equity_curve: &[f64]) -> f64 {
    if equity_curve.len() < 3 {
        return 0.0;
    }

    let mut returns = Vec::with_capacity(equity_curve.len() - 1);
    for w in equity_curve.windows(2) {
        if w[0] > 0.0 {
            returns.push((w[1] - w[0]) / w[0]);
        }
    }
    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>()
        / returns.len() as f64;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        if mean > 0.0 {
            return 10.0;
        }
        return 0.0;
    }

    mean / std_dev
}

/// Sector membership is fixed; symbols absent from the snapshot map are
/// simply skipped.
const SECTORS: &[(&str, &[&str])] = &[
    ("Major", &["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"]),
    ("Meme", &["DOGEUSDT", "SHIBUSDT", "PEPEUSDT", "WIFUSDT"]),
    ("AI", &["FETUSDT", "RENDERUSDT", "TAOUSDT", "WLDUSDT"]),
    ("L2", &["ARBUSDT", "OPUSDT", "STRKUSDT", "ZKUSDT"]),
];

/// Average the 1h/4h price changes of each sector's members present in the
/// snapshot map; the leader is the member with the largest 1h change.
/// Sectors with no member present are omitted.
pub fn sector_heatmap(market: &BTreeMap<String, MarketSnapshot>) -> Vec<Sector> {
    let mut sectors = Vec::new();

    for (name, members) in SECTORS {
        let mut sum_1h = 0.0;
        let mut sum_4h = 0.0;
        let mut count = 0usize;
        let mut leader = "";
        let mut leader_change = f64::NEG_INFINITY;

        for symbol in *members {
            let Some(md) = market.get(*symbol) else {
                continue;
            };
            sum_1h += md.price_change_1h;
            sum_4h += md.price_change_4h;
            count += 1;
            if md.price_change_1h > leader_change {
                leader_change = md.price_change_1h;
                leader = symbol;
            }
        }

        if count > 0 {
            sectors.push(Sector {
                name: name.to_string(),
                avg_change_1h: sum_1h / count as f64,
                avg_change_4h: sum_4h / count as f64,
                leader: leader.to_string(),
            });
        }
    }

    sectors
}

/// Inputs gathered by the control loop for one cycle.
pub struct ContextInputs {
    pub now: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub cycle: u64,
    pub account: Account,
    pub positions: Vec<Position>,
    pub market: BTreeMap<String, MarketSnapshot>,
    pub equity_curve: Vec<f64>,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
}

/// Compose the per-cycle context.
pub fn build_context(inputs: ContextInputs) -> TradeContext {
    let sharpe = runtime_sharpe(&inputs.equity_curve);
    let sectors = sector_heatmap(&inputs.market);

    TradeContext {
        current_time: inputs.now.format("%Y-%m-%d %H:%M:%S").to_string(),
        runtime_minutes: (inputs.now - inputs.started_at).num_minutes(),
        cycle: inputs.cycle,
        account: inputs.account,
        positions: inputs.positions,
        market: inputs.market,
        sectors,
        sharpe_ratio: sharpe,
        btc_eth_leverage: inputs.btc_eth_leverage,
        altcoin_leverage: inputs.altcoin_leverage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sharpe_needs_three_points() {
        assert_eq!(runtime_sharpe(&[]), 0.0);
        assert_eq!(runtime_sharpe(&[100.0, 110.0]), 0.0);
    }

    #[test]
    fn sharpe_perfect_up_is_ten() {
        // Constant positive return: sigma = 0, mean > 0.
        assert_eq!(runtime_sharpe(&[100.0, 110.0, 121.0]), 10.0);
    }

    #[test]
    fn sharpe_flat_is_zero() {
        assert_eq!(runtime_sharpe(&[100.0, 100.0, 100.0]), 0.0);
    }

    #[test]
    fn sharpe_mixed_returns_is_mean_over_sigma() {
        // Returns +10%, -10%: mean 0, sigma 0.1 -> 0.
        let v = runtime_sharpe(&[100.0, 110.0, 99.0]);
        assert!(v.abs() < 1e-9);
    }

    #[test]
    fn sharpe_skips_nonpositive_equity_points() {
        // The 0 point contributes no return.
        let v = runtime_sharpe(&[0.0, 100.0, 110.0, 121.0]);
        assert_eq!(v, 10.0);
    }

    #[test]
    fn sectors_average_present_members() {
        let mut market = BTreeMap::new();
        for (symbol, c1, c4) in [
            ("BTCUSDT", 2.0, 4.0),
            ("ETHUSDT", 4.0, 8.0),
            ("DOGEUSDT", -1.0, -2.0),
        ] {
            market.insert(
                symbol.to_string(),
                MarketSnapshot {
                    symbol: symbol.to_string(),
                    price_change_1h: c1,
                    price_change_4h: c4,
                    ..Default::default()
                },
            );
        }

        let sectors = sector_heatmap(&market);
        assert_eq!(sectors.len(), 2);
        let major = &sectors[0];
        assert_eq!(major.name, "Major");
        assert!((major.avg_change_1h - 3.0).abs() < 1e-9);
        assert!((major.avg_change_4h - 6.0).abs() < 1e-9);
        assert_eq!(major.leader, "ETHUSDT");
        let meme = &sectors[1];
        assert_eq!(meme.name, "Meme");
        assert_eq!(meme.leader, "DOGEUSDT");
    }

    #[test]
    fn context_composition() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let started = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let ctx = build_context(ContextInputs {
            now,
            started_at: started,
            cycle: 7,
            account: Account {
                total_equity: 1000.0,
                ..Default::default()
            },
            positions: vec![],
            market: BTreeMap::new(),
            equity_curve: vec![100.0, 110.0, 121.0],
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
        });
        assert_eq!(ctx.runtime_minutes, 150);
        assert_eq!(ctx.cycle, 7);
        assert_eq!(ctx.sharpe_ratio, 10.0);
        assert_eq!(ctx.current_time, "2024-06-01 12:30:00");
    }
}
