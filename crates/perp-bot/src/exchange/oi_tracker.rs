//! Bounded open-interest history used to derive 1h/4h OI changes.
//!
//! The exchange only reports the latest OI, so changes are computed against
//! a locally recorded series. Entries older than five hours are pruned on
//! every record.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

const RETENTION_HOURS: i64 = 5;

#[derive(Debug, Clone, Copy)]
struct OiSnapshot {
    timestamp: DateTime<Utc>,
    value: f64,
}

/// Per-symbol OI time series. Owned by the live adaptor; not shared.
#[derive(Debug, Default)]
pub struct OiTracker {
    snapshots: HashMap<String, Vec<OiSnapshot>>,
}

impl OiTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest OI value and drop anything past retention.
    pub fn record(&mut self, symbol: &str, value: f64, now: DateTime<Utc>) {
        let series = self.snapshots.entry(symbol.to_string()).or_default();
        series.push(OiSnapshot {
            timestamp: now,
            value,
        });

        let cutoff = now - Duration::hours(RETENTION_HOURS);
        series.retain(|s| s.timestamp > cutoff);
    }

    /// Percent change between the latest value and the snapshot closest to
    /// `window` ago. 0 when there is not enough history.
    pub fn change_pct(&self, symbol: &str, window: Duration) -> f64 {
        let Some(series) = self.snapshots.get(symbol) else {
            return 0.0;
        };
        if series.len() < 2 {
            return 0.0;
        }

        let current = series[series.len() - 1];
        let target = current.timestamp - window;

        // Walk backwards to the snapshot nearest the target time; the
        // series is chronological so the distance shrinks then grows.
        let mut best: Option<&OiSnapshot> = None;
        let mut best_diff = Duration::hours(100);
        for s in series[..series.len() - 1].iter().rev() {
            let diff = (s.timestamp - target).abs();
            if diff < best_diff {
                best_diff = diff;
                best = Some(s);
            } else {
                break;
            }
        }

        match best {
            Some(s) if s.value > 0.0 => (current.value - s.value) / s.value * 100.0,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    #[test]
    fn change_requires_history() {
        let mut t = OiTracker::new();
        assert_eq!(t.change_pct("BTCUSDT", Duration::hours(1)), 0.0);
        t.record("BTCUSDT", 100.0, at(0));
        assert_eq!(t.change_pct("BTCUSDT", Duration::hours(1)), 0.0);
    }

    #[test]
    fn change_uses_nearest_snapshot() {
        let mut t = OiTracker::new();
        t.record("BTCUSDT", 100.0, at(0));
        t.record("BTCUSDT", 105.0, at(30));
        t.record("BTCUSDT", 110.0, at(60));
        // 1h window from t=60 targets t=0: value 100 -> +10%.
        let chg = t.change_pct("BTCUSDT", Duration::hours(1));
        assert!((chg - 10.0).abs() < 1e-9);
        // 30m window targets t=30: value 105.
        let chg = t.change_pct("BTCUSDT", Duration::minutes(30));
        assert!((chg - (110.0 - 105.0) / 105.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn old_entries_are_pruned() {
        let mut t = OiTracker::new();
        t.record("BTCUSDT", 100.0, at(0));
        t.record("BTCUSDT", 200.0, at(60 * 6)); // six hours later
        // The first snapshot fell outside the 5h retention, so there is
        // only one entry left and no change can be computed.
        assert_eq!(t.change_pct("BTCUSDT", Duration::hours(4)), 0.0);
    }

    #[test]
    fn symbols_are_independent() {
        let mut t = OiTracker::new();
        t.record("BTCUSDT", 100.0, at(0));
        t.record("BTCUSDT", 110.0, at(60));
        t.record("ETHUSDT", 50.0, at(0));
        t.record("ETHUSDT", 45.0, at(60));
        assert!(t.change_pct("BTCUSDT", Duration::hours(1)) > 0.0);
        assert!(t.change_pct("ETHUSDT", Duration::hours(1)) < 0.0);
    }
}
