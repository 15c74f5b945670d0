//! Bounded trade-record history with on-disk persistence.
//!
//! Keeps the newest 100 records in memory (newest first), suppresses exact
//! duplicates (the live fill sync re-reads the same trades every pass), and
//! saves up to 500 records to a JSON file off the hot path.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::types::TradeRecord;

const MAX_IN_MEMORY: usize = 100;
const MAX_IN_FILE: usize = 500;

/// Shared, thread-safe trade history.
#[derive(Debug, Clone)]
pub struct TradeHistoryManager {
    records: Arc<Mutex<Vec<TradeRecord>>>,
    path: PathBuf,
}

impl TradeHistoryManager {
    /// Create the manager and load any existing history from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut records: Vec<TradeRecord> = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "trade history unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "trade history unreadable, starting empty");
                Vec::new()
            }
        };
        records.truncate(MAX_IN_MEMORY);

        Self {
            records: Arc::new(Mutex::new(records)),
            path,
        }
    }

    /// Insert a record at the front unless an identical one already exists,
    /// then persist asynchronously when a runtime is available.
    pub fn add(&self, record: TradeRecord) {
        let snapshot = {
            let mut records = self.records.lock().expect("history lock poisoned");
            if records.iter().any(|r| *r == record) {
                return;
            }
            records.insert(0, record);
            records.truncate(MAX_IN_MEMORY);
            records.clone()
        };

        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || save_records(&path, &snapshot));
            }
            Err(_) => save_records(&path, &snapshot),
        }
    }

    /// Copy of the history, newest first.
    pub fn history(&self) -> Vec<TradeRecord> {
        self.records.lock().expect("history lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn save_records(path: &PathBuf, records: &[TradeRecord]) {
    let bounded = &records[..records.len().min(MAX_IN_FILE)];
    match serde_json::to_vec_pretty(bounded) {
        Ok(data) => {
            if let Err(e) = std::fs::write(path, data) {
                warn!(path = %path.display(), error = %e, "trade history save failed");
            }
        }
        Err(e) => warn!(error = %e, "trade history serialization failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_common::Side;

    fn record(symbol: &str, pnl: f64) -> TradeRecord {
        TradeRecord {
            time: "2024-06-01 10:00:00".into(),
            symbol: symbol.into(),
            side: Side::Long,
            action: "close_long".into(),
            entry_price: 100.0,
            exit_price: 110.0,
            quantity: 1.0,
            pnl,
            pnl_pct: 10.0,
            reason: "test".into(),
        }
    }

    #[test]
    fn newest_record_goes_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TradeHistoryManager::load(dir.path().join("h.json"));
        mgr.add(record("BTCUSDT", 1.0));
        mgr.add(record("ETHUSDT", 2.0));
        let history = mgr.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].symbol, "ETHUSDT");
    }

    #[test]
    fn exact_duplicates_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TradeHistoryManager::load(dir.path().join("h.json"));
        mgr.add(record("BTCUSDT", 1.0));
        mgr.add(record("BTCUSDT", 1.0));
        assert_eq!(mgr.len(), 1);
        // Different PnL is a different record.
        mgr.add(record("BTCUSDT", 2.0));
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn memory_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TradeHistoryManager::load(dir.path().join("h.json"));
        for i in 0..150 {
            mgr.add(record("BTCUSDT", i as f64));
        }
        assert_eq!(mgr.len(), MAX_IN_MEMORY);
        // Newest survives the cap.
        assert_eq!(mgr.history()[0].pnl, 149.0);
    }

    #[test]
    fn reload_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.json");
        {
            let mgr = TradeHistoryManager::load(&path);
            mgr.add(record("BTCUSDT", 5.0));
        }
        let mgr = TradeHistoryManager::load(&path);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.history()[0].pnl, 5.0);
    }
}
