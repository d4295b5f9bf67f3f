use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{Order, Position, RiskState};
use crate::error::{KeeperError, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume after an uncontrolled stop.
///
/// Holds no save timestamp, so reconciling an unchanged exchange twice
/// writes the same bytes twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    pub position: Option<Position>,
    pub live_order: Option<Order>,
    /// Most recent terminal order, kept to recognise late duplicate events
    #[serde(default)]
    pub last_order: Option<Order>,
    pub risk: RiskState,
    /// Unresolved reconciliation mismatch; blocks new orders while set
    #[serde(default)]
    pub inconsistency: Option<String>,
}

impl PersistedSnapshot {
    /// Cold-start state
    pub fn fresh(starting_balance: Decimal) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            position: None,
            live_order: None,
            last_order: None,
            risk: RiskState::new(starting_balance, Utc::now()),
            inconsistency: None,
        }
    }
}

/// Durable load/save of the snapshot. Stores do not interpret the payload.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    async fn load(&self) -> Result<Option<PersistedSnapshot>>;

    /// Returns only once the snapshot is durable
    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<()>;
}

/// JSON file replaced atomically: write temp, fsync, rename over, fsync the directory.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persistence_err(action: &str, path: &Path, e: impl std::fmt::Display) -> KeeperError {
        KeeperError::Persistence(format!("{} {}: {}", action, path.display(), e))
    }

    /// Flush the directory entry so a completed rename survives power loss
    #[cfg(unix)]
    async fn sync_dir(dir: &Path) -> Result<()> {
        let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
        tokio::fs::File::open(dir)
            .await
            .map_err(|e| Self::persistence_err("open dir", dir, e))?
            .sync_all()
            .await
            .map_err(|e| Self::persistence_err("sync dir", dir, e))
    }

    #[cfg(not(unix))]
    async fn sync_dir(_dir: &Path) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<PersistedSnapshot>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::persistence_err("read", &self.path, e)),
        };
        let snapshot: PersistedSnapshot = serde_json::from_str(&raw)
            .map_err(|e| Self::persistence_err("parse", &self.path, e))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(KeeperError::Persistence(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let Some(parent) = self.path.parent() else {
            return Err(KeeperError::Persistence("invalid state path".to_string()));
        };
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::persistence_err("create dir", parent, e))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Self::persistence_err("create", &tmp, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| Self::persistence_err("write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::persistence_err("sync", &tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Self::persistence_err("rename", &self.path, e))?;
        Self::sync_dir(parent).await?;
        debug!(path = %self.path.display(), bytes = body.len(), "snapshot saved");
        Ok(())
    }
}

/// In-memory store for tests and replays; can be told to fail saves.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<PersistedSnapshot>>,
    fail_saves: AtomicU32,
    saves: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: PersistedSnapshot) -> Self {
        Self {
            inner: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Make the next `n` saves fail
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn current(&self) -> Option<PersistedSnapshot> {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Option<PersistedSnapshot>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let failing = self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(KeeperError::Persistence("injected save failure".to_string()));
        }
        *self.inner.lock().await = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntentKind, OrderSide};
    use rust_decimal_macros::dec;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("spotkeeper_test_{}", uuid::Uuid::new_v4().simple()))
            .join(name)
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let store = JsonFileStore::new(temp_path("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_atomically_and_leaves_no_temp() {
        let path = temp_path("state.json");
        let store = JsonFileStore::new(&path);

        let mut snap = PersistedSnapshot::fresh(dec!(100));
        snap.live_order = Some(Order::new(
            "BTC-USDT",
            OrderSide::Buy,
            IntentKind::Open,
            dec!(0.1),
            Some(dec!(50000)),
        ));
        store.save(&snap).await.unwrap();
        snap.risk.daily_pnl = dec!(-1.5);
        store.save(&snap).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert!(!path.with_extension("json.tmp").exists());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_sync_reports_missing_directory() {
        let path = temp_path("state.json");
        let dir = path.parent().unwrap().to_path_buf();
        let err = JsonFileStore::sync_dir(&dir).await.unwrap_err();
        assert!(matches!(err, KeeperError::Persistence(_)));

        std::fs::create_dir_all(&dir).unwrap();
        JsonFileStore::sync_dir(&dir).await.unwrap();
        JsonFileStore::sync_dir(Path::new("")).await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_a_cold_start() {
        let path = temp_path("state.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, KeeperError::Persistence(_)));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn memory_store_injected_failure() {
        let store = MemoryStore::new();
        store.fail_next_saves(1);
        let snap = PersistedSnapshot::fresh(dec!(10));
        assert!(store.save(&snap).await.is_err());
        assert!(store.save(&snap).await.is_ok());
        assert_eq!(store.save_count(), 1);
    }
}
