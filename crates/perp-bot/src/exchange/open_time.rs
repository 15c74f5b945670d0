//! Persistence of first-open timestamps per (side, symbol).
//!
//! Holding duration must survive process restarts, so the table is written
//! to a small JSON file (atomic write-then-rename) after every position
//! refresh and pruned when positions disappear.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::warn;

use perp_common::Side;

/// `side:symbol` -> first-open epoch milliseconds.
#[derive(Debug)]
pub struct OpenTimeStore {
    path: PathBuf,
    times: HashMap<String, i64>,
}

fn key(side: Side, symbol: &str) -> String {
    format!("{side}:{symbol}")
}

impl OpenTimeStore {
    /// Load the table from disk; a missing or corrupt file yields an empty
    /// table.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let times = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, i64>>(&data) {
                Ok(map) => map.into_iter().filter(|(_, v)| *v > 0).collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "open-time table unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "open-time table unreadable, starting empty");
                HashMap::new()
            }
        };
        Self { path, times }
    }

    /// First-open time for the pair, inserting `now_ms` when unseen.
    pub fn get_or_insert(&mut self, side: Side, symbol: &str, now_ms: i64) -> i64 {
        *self.times.entry(key(side, symbol)).or_insert(now_ms)
    }

    /// Drop entries for pairs that are no longer open.
    pub fn prune<'a>(&mut self, active: impl IntoIterator<Item = (Side, &'a str)>) {
        let keep: HashSet<String> = active
            .into_iter()
            .map(|(side, symbol)| key(side, symbol))
            .collect();
        self.times.retain(|k, _| keep.contains(k));
    }

    pub fn remove(&mut self, side: Side, symbol: &str) {
        self.times.remove(&key(side, symbol));
    }

    /// Write the table atomically. Failures are logged, not fatal: the
    /// worst case is a reset holding duration after a restart.
    pub fn save(&self) {
        let data = match serde_json::to_vec_pretty(&self.times) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "open-time table serialization failed");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, &data) {
            warn!(path = %tmp.display(), error = %e, "open-time table write failed");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(path = %self.path.display(), error = %e, "open-time table rename failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open_times.json");

        let mut store = OpenTimeStore::load(&path);
        assert_eq!(store.get_or_insert(Side::Long, "BTCUSDT", 1000), 1000);
        // Existing entry wins over a later timestamp.
        assert_eq!(store.get_or_insert(Side::Long, "BTCUSDT", 2000), 1000);
        store.get_or_insert(Side::Short, "BTCUSDT", 3000);
        store.save();

        let mut reloaded = OpenTimeStore::load(&path);
        assert_eq!(reloaded.get_or_insert(Side::Long, "BTCUSDT", 9999), 1000);
        assert_eq!(reloaded.get_or_insert(Side::Short, "BTCUSDT", 9999), 3000);
    }

    #[test]
    fn prune_drops_closed_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OpenTimeStore::load(dir.path().join("t.json"));
        store.get_or_insert(Side::Long, "BTCUSDT", 1);
        store.get_or_insert(Side::Short, "ETHUSDT", 2);
        store.prune([(Side::Long, "BTCUSDT")]);
        assert_eq!(store.get_or_insert(Side::Long, "BTCUSDT", 100), 1);
        // The pruned pair starts over.
        assert_eq!(store.get_or_insert(Side::Short, "ETHUSDT", 100), 100);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();
        let mut store = OpenTimeStore::load(&path);
        assert_eq!(store.get_or_insert(Side::Long, "BTCUSDT", 42), 42);
    }
}
