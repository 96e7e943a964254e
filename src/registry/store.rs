//! Persistence of known watches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::{Transport, TransportKind};

/// A persisted known watch, keyed by transport identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownWatchRecord {
    /// Transport identifier.
    pub identifier: String,
    /// Transport kind.
    #[serde(rename = "transport_type")]
    pub transport_kind: TransportKind,
    /// Display name.
    pub name: String,
    /// Last running firmware version tag.
    pub running_fw_version: String,
    /// Serial number.
    pub serial: String,
    /// Whether the user wants the watch connected.
    pub connect_goal: bool,
    /// When the watch last finished connecting.
    pub last_connected: Option<DateTime<Utc>>,
}

impl KnownWatchRecord {
    /// The transport this record describes.
    pub fn transport(&self) -> Transport {
        Transport::new(self.transport_kind, self.identifier.clone(), self.name.clone())
    }
}

/// Storage for known watches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnownWatchStore: Send + Sync {
    /// Every stored record.
    async fn load_all(&self) -> Result<Vec<KnownWatchRecord>>;

    /// Insert or replace a record.
    async fn upsert(&self, record: &KnownWatchRecord) -> Result<()>;

    /// Delete the record for `identifier`, if any.
    async fn delete(&self, identifier: &str) -> Result<()>;
}

/// Records kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, KnownWatchRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a record up.
    pub fn get(&self, identifier: &str) -> Option<KnownWatchRecord> {
        self.records.read().get(identifier).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl KnownWatchStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<KnownWatchRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn upsert(&self, record: &KnownWatchRecord) -> Result<()> {
        self.records
            .write()
            .insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.records.write().remove(identifier);
        Ok(())
    }
}

/// Records kept in one JSON document.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store records at `path`. The file is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<BTreeMap<String, KnownWatchRecord>> {
        match fs::read_to_string(&self.path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No known watches at {:?}", self.path);
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, records: &BTreeMap<String, KnownWatchRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(records)?;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl KnownWatchStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<KnownWatchRecord>> {
        let _guard = self.lock.lock().await;
        let records = self.read().await?;
        debug!("Loaded {} known watches", records.len());
        Ok(records.into_values().collect())
    }

    async fn upsert(&self, record: &KnownWatchRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await.unwrap_or_else(|e| {
            warn!("Replacing unreadable known watch file: {}", e);
            BTreeMap::new()
        });
        records.insert(record.identifier.clone(), record.clone());
        self.write(&records).await
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        if records.remove(identifier).is_some() {
            self.write(&records).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(identifier: &str) -> KnownWatchRecord {
        KnownWatchRecord {
            identifier: identifier.to_string(),
            transport_kind: TransportKind::BluetoothLe,
            name: "Pebble Time 1A2B".to_string(),
            running_fw_version: "v4.4.0".to_string(),
            serial: "Q402445E1A2B".to_string(),
            connect_goal: false,
            last_connected: Some(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("watches.json"));
        assert!(store.load_all().await.unwrap().is_empty());

        store.upsert(&record("AA")).await.unwrap();
        let mut updated = record("AA");
        updated.connect_goal = true;
        store.upsert(&updated).await.unwrap();
        store.upsert(&record("BB")).await.unwrap();
        store.delete("BB").await.unwrap();

        let reopened = JsonFileStore::new(dir.path().join("watches.json"));
        assert_eq!(reopened.load_all().await.unwrap(), vec![updated]);
    }

    #[tokio::test]
    async fn test_json_uses_transport_type_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watches.json");
        JsonFileStore::new(&path).upsert(&record("AA")).await.unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains(r#""transport_type": "BluetoothLe""#));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.upsert(&record("AA")).await.unwrap();
        assert_eq!(store.get("AA"), Some(record("AA")));
        store.delete("AA").await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_transport() {
        let transport = record("AA").transport();
        assert_eq!(transport, Transport::ble("AA", "anything"));
        assert_eq!(transport.name(), "Pebble Time 1A2B");
    }
}
