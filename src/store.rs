use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const POSITIONS_FILE: &str = "positions.json";
pub const DAILY_STATS_FILE: &str = "daily_stats.json";
pub const CAPITAL_FILE: &str = "capital.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const KELLY_FILE: &str = "kelly_trades.json";
pub const TRACKED_ORDERS_FILE: &str = "tracked_orders.json";

/// JSON file store with atomic writes (write temp, then rename).
///
/// One file per persisted entity; each file is owned by exactly one
/// component, so no cross-component read/write races exist.
#[derive(Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create data dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let data = serde_json::to_vec_pretty(value).context("serialize state")?;
        std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Loads a persisted entity. A missing or corrupted file yields `None`
    /// (corruption is logged; the caller re-initializes empty state).
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.path(name);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("store.corrupt file={} err={}", path.display(), e);
                None
            }
        }
    }
}
