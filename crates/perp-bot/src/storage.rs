//! JSON file storage for run artifacts.
//!
//! One file holds four append-only arrays: equity snapshots, trade records,
//! advisor decision records, and configuration snapshots. Every mutation
//! rewrites the file atomically (write `.tmp`, then rename), so a crash
//! mid-save never corrupts existing data.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{FullDecision, TradeRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// One advisor turn, flattened for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub cot_trace: String,
    pub decisions_json: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub config_json: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageData {
    #[serde(default)]
    equity_snapshots: Vec<EquitySnapshot>,
    #[serde(default)]
    trade_records: Vec<TradeRecord>,
    #[serde(default)]
    decision_records: Vec<DecisionRecord>,
    #[serde(default)]
    config_snapshots: Vec<ConfigSnapshot>,
}

struct Inner {
    data: StorageData,
    next_id: i64,
}

/// File-backed storage. Constructed once at startup; cheap operations, all
/// serialized through one lock.
pub struct Storage {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Storage {
    /// Open or create the storage file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create data directory {}", dir.display()))?;
            }
        }

        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse storage file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "creating new storage file");
                StorageData::default()
            }
            Err(e) => return Err(e).context(format!("read storage file {}", path.display())),
        };

        let next_id = data
            .equity_snapshots
            .iter()
            .map(|s| s.id)
            .chain(data.decision_records.iter().map(|r| r.id))
            .chain(data.config_snapshots.iter().map(|c| c.id))
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            path,
            inner: Mutex::new(Inner { data, next_id }),
        })
    }

    fn save(&self, inner: &Inner) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&inner.data)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }

    pub fn save_equity_snapshot(
        &self,
        timestamp: DateTime<Utc>,
        equity: f64,
        pnl: f64,
        pnl_pct: f64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.data.equity_snapshots.push(EquitySnapshot {
            id,
            timestamp,
            equity,
            pnl,
            pnl_pct,
        });
        self.save(&inner)
    }

    pub fn save_trade_record(&self, record: TradeRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.data.trade_records.push(record);
        self.save(&inner)
    }

    pub fn save_decision(&self, decision: &FullDecision) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        let record = DecisionRecord {
            id,
            timestamp: decision.timestamp,
            cot_trace: decision.cot_trace.clone(),
            decisions_json: serde_json::to_string(&decision.decisions)?,
            system_prompt: decision.system_prompt.clone(),
            user_prompt: decision.user_prompt.clone(),
        };
        inner.data.decision_records.push(record);
        self.save(&inner)
    }

    pub fn save_config_snapshot(
        &self,
        timestamp: DateTime<Utc>,
        config: &impl Serialize,
        reason: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        let snapshot = ConfigSnapshot {
            id,
            timestamp,
            config_json: serde_json::to_string(config)?,
            reason: reason.to_string(),
        };
        inner.data.config_snapshots.push(snapshot);
        self.save(&inner)
    }

    /// Most recent `limit` equity snapshots, oldest first.
    pub fn equity_history(&self, limit: usize) -> Vec<EquitySnapshot> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        let mut snapshots = inner.data.equity_snapshots.clone();
        snapshots.sort_by_key(|s| s.timestamp);
        let limit = if limit == 0 { 1000 } else { limit };
        if snapshots.len() > limit {
            snapshots.split_off(snapshots.len() - limit)
        } else {
            snapshots
        }
    }

    /// Paged trade records, newest first, plus the total count.
    pub fn trade_records(&self, limit: usize, offset: usize) -> (Vec<TradeRecord>, usize) {
        let inner = self.inner.lock().expect("storage lock poisoned");
        let total = inner.data.trade_records.len();
        let limit = if limit == 0 { 50 } else { limit };
        let records = inner
            .data
            .trade_records
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (records, total)
    }

    /// Most recent `limit` decision records, newest first.
    pub fn decision_records(&self, limit: usize) -> Vec<DecisionRecord> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        let limit = if limit == 0 { 50 } else { limit };
        let mut records = inner.data.decision_records.clone();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }

    /// Aggregate win/loss stats over all stored trade records.
    pub fn trade_stats(&self) -> TradeStats {
        let inner = self.inner.lock().expect("storage lock poisoned");
        let mut stats = TradeStats::default();
        for r in &inner.data.trade_records {
            stats.total_trades += 1;
            stats.total_pnl += r.pnl;
            if r.pnl > 0.0 {
                stats.win_trades += 1;
                stats.max_win = stats.max_win.max(r.pnl);
            } else if r.pnl < 0.0 {
                stats.lose_trades += 1;
                stats.max_loss = stats.max_loss.min(r.pnl);
            }
        }
        if stats.total_trades > 0 {
            stats.win_rate = stats.win_trades as f64 / stats.total_trades as f64 * 100.0;
            stats.avg_pnl = stats.total_pnl / stats.total_trades as f64;
        }
        stats
    }

    /// Drop old decision records and thin old equity snapshots to one per
    /// day past the retention window.
    pub fn clean_old_data(&self, now: DateTime<Utc>, retention_days: i64) -> Result<()> {
        let retention_days = if retention_days <= 0 { 90 } else { retention_days };
        let cutoff = now - chrono::Duration::days(retention_days);

        let mut inner = self.inner.lock().expect("storage lock poisoned");

        let mut kept = Vec::new();
        let mut daily_first: std::collections::HashMap<String, EquitySnapshot> =
            std::collections::HashMap::new();
        for snap in inner.data.equity_snapshots.drain(..) {
            if snap.timestamp > cutoff {
                kept.push(snap);
            } else {
                let day = snap.timestamp.format("%Y-%m-%d").to_string();
                daily_first.entry(day).or_insert(snap);
            }
        }
        kept.extend(daily_first.into_values());
        kept.sort_by_key(|s| s.timestamp);
        inner.data.equity_snapshots = kept;

        inner.data.decision_records.retain(|r| r.timestamp > cutoff);

        info!(retention_days, "old storage data cleaned");
        self.save(&inner)
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub win_trades: usize,
    pub lose_trades: usize,
    pub total_pnl: f64,
    pub max_win: f64,
    pub max_loss: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_common::Side;

    fn record(pnl: f64) -> TradeRecord {
        TradeRecord {
            time: "2024-06-01 10:00:00".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            action: "close_long".into(),
            entry_price: 100.0,
            exit_price: 110.0,
            quantity: 1.0,
            pnl,
            pnl_pct: 10.0,
            reason: String::new(),
        }
    }

    #[test]
    fn ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        {
            let storage = Storage::open(&path).unwrap();
            storage
                .save_equity_snapshot(Utc::now(), 1000.0, 0.0, 0.0)
                .unwrap();
            storage
                .save_equity_snapshot(Utc::now(), 1010.0, 10.0, 1.0)
                .unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        storage
            .save_equity_snapshot(Utc::now(), 1020.0, 20.0, 2.0)
            .unwrap();
        let history = storage.equity_history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].id, 3);
    }

    #[test]
    fn trade_records_page_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("s.json")).unwrap();
        for i in 0..5 {
            storage.save_trade_record(record(i as f64)).unwrap();
        }
        let (page, total) = storage.trade_records(2, 0);
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].pnl, 4.0);
        let (page, _) = storage.trade_records(2, 4);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].pnl, 0.0);
    }

    #[test]
    fn stats_aggregate_wins_and_losses() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("s.json")).unwrap();
        for pnl in [10.0, -5.0, 20.0] {
            storage.save_trade_record(record(pnl)).unwrap();
        }
        let stats = storage.trade_stats();
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.win_trades, 2);
        assert_eq!(stats.lose_trades, 1);
        assert!((stats.total_pnl - 25.0).abs() < 1e-9);
        assert_eq!(stats.max_win, 20.0);
        assert_eq!(stats.max_loss, -5.0);
    }

    #[test]
    fn decision_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("s.json")).unwrap();
        let decision = FullDecision {
            system_prompt: "sys".into(),
            user_prompt: "usr".into(),
            cot_trace: "thinking".into(),
            decisions: vec![],
            timestamp: Utc::now(),
        };
        storage.save_decision(&decision).unwrap();
        let records = storage.decision_records(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cot_trace, "thinking");
        assert_eq!(records[0].decisions_json, "[]");
    }

    #[test]
    fn cleanup_keeps_one_equity_point_per_old_day() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("s.json")).unwrap();
        let now = Utc::now();
        let old_day = now - chrono::Duration::days(120);
        storage
            .save_equity_snapshot(old_day, 900.0, 0.0, 0.0)
            .unwrap();
        storage
            .save_equity_snapshot(old_day + chrono::Duration::hours(1), 910.0, 10.0, 1.0)
            .unwrap();
        storage.save_equity_snapshot(now, 1000.0, 100.0, 10.0).unwrap();

        storage.clean_old_data(now, 90).unwrap();
        let history = storage.equity_history(10);
        // One survivor from the old day, plus the recent point.
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].equity, 900.0);
    }
}
