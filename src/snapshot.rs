use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::market::{normalize_market_data, unix_timestamp, EconomicIndicators, MarketData};

const DEFAULT_SNAPSHOT_DIR: &str = "data/snapshot";
const DEFAULT_MAX_AGE_SECS: f64 = 3600.0;

/// Persisted per-period capture of the market feed, so repeated report runs
/// for the same period reuse one consistent data pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub period: String,
    pub market_data: MarketData,
    pub economic_data: EconomicIndicators,
    pub normalized: BTreeMap<String, f64>,
    pub timestamp: f64,
    #[serde(default)]
    pub pinned: bool,
}

impl Snapshot {
    pub fn new(period: &str, market_data: MarketData, economic_data: EconomicIndicators) -> Self {
        let normalized = normalize_market_data(&market_data, &economic_data);
        Self {
            period: period.to_string(),
            market_data,
            economic_data,
            normalized,
            timestamp: unix_timestamp(),
            pinned: false,
        }
    }

    /// Pinned snapshots never expire; unpinned ones age out.
    pub fn is_valid(&self) -> bool {
        if self.pinned {
            return true;
        }
        let max_age = env::var("SNAPSHOT_MAX_AGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_AGE_SECS);
        unix_timestamp() - self.timestamp < max_age
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let dir = env::var("SNAPSHOT_DIR").unwrap_or_else(|_| DEFAULT_SNAPSHOT_DIR.to_string());
        Self { dir: PathBuf::from(dir) }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, period: &str) -> PathBuf {
        self.dir.join(format!("{period}.json"))
    }

    /// Load the snapshot for `period` if one exists and is still valid.
    pub fn load(&self, period: &str) -> Option<Snapshot> {
        let path = self.path_for(period);
        if !path.exists() {
            return None;
        }

        match read_snapshot(&path) {
            Ok(snapshot) if snapshot.is_valid() => {
                info!("loaded valid snapshot from {}", path.display());
                Some(snapshot)
            }
            Ok(_) => {
                info!("snapshot {} is stale, will refresh", path.display());
                None
            }
            Err(e) => {
                error!("error loading snapshot {}: {e}", path.display());
                None
            }
        }
    }

    /// Persist a snapshot unless pinning is active (test fixture mode).
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if env::var("PIN_SNAPSHOTS").map(|v| v.to_lowercase()) == Ok("true".to_string()) {
            info!("snapshots are pinned, skipping save");
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&snapshot.period);
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| crate::error::Error::Pipeline(format!("snapshot encode: {e}")))?;
        fs::write(&path, json)?;

        info!("saved snapshot to {}", path.display());
        Ok(())
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| crate::error::Error::Pipeline(format!("snapshot decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketDataClient;
    use crate::retry::RetryPolicy;
    use tempfile::tempdir;

    async fn sample(period: &str) -> Snapshot {
        let client = MarketDataClient::new(true, RetryPolicy::default()).unwrap();
        let market = client.get_market_data(period).await;
        let economic = client.get_economic_indicators(period).await;
        Snapshot::new(period, market, economic)
    }

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::with_dir(dir.path());

        let snapshot = sample("2025-Q2").await;
        store.save(&snapshot).unwrap();

        let loaded = store.load("2025-Q2").unwrap();
        assert_eq!(loaded.period, "2025-Q2");
        assert_eq!(loaded.normalized["sp500_tr"], 12.3);
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::with_dir(dir.path());
        assert!(store.load("2019-Q4").is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_is_discarded() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::with_dir(dir.path());

        let mut snapshot = sample("2024-Q1").await;
        snapshot.timestamp -= 7200.0;
        store.save(&snapshot).unwrap();
        assert!(store.load("2024-Q1").is_none());
    }

    #[tokio::test]
    async fn pinned_snapshot_never_expires() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::with_dir(dir.path());

        let mut snapshot = sample("2024-Q2").await;
        snapshot.timestamp -= 7200.0;
        snapshot.pinned = true;
        store.save(&snapshot).unwrap();
        assert!(store.load("2024-Q2").is_some());
    }
}
