//! Store contracts injected into the orchestrator, with libSQL and in-memory
//! implementations.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use sourcewatch_shared::{HealthRecord, Item, Result};
use sourcewatch_storage::Storage;

/// Persistent set of item uids already emitted.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, uid: &str) -> Result<bool>;

    /// Record an item. Inserting a known uid is a no-op.
    async fn insert(&self, item: &Item) -> Result<()>;
}

/// Persistent health records keyed by source id.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, HealthRecord>>;
    async fn save(&self, source_id: &str, record: &HealthRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// libSQL
// ---------------------------------------------------------------------------

#[async_trait]
impl DedupStore for Storage {
    async fn exists(&self, uid: &str) -> Result<bool> {
        self.item_exists(uid).await
    }

    async fn insert(&self, item: &Item) -> Result<()> {
        self.insert_item(item).await.map(|_| ())
    }
}

#[async_trait]
impl HealthStore for Storage {
    async fn load(&self) -> Result<HashMap<String, HealthRecord>> {
        self.load_health().await
    }

    async fn save(&self, source_id: &str, record: &HealthRecord) -> Result<()> {
        self.upsert_health(source_id, record).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Dedup store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    items: Mutex<Vec<Item>>,
    uids: Mutex<HashSet<String>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.uids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.uids.lock().await.is_empty()
    }

    /// Items in insertion order.
    pub async fn items(&self) -> Vec<Item> {
        self.items.lock().await.clone()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn exists(&self, uid: &str) -> Result<bool> {
        Ok(self.uids.lock().await.contains(uid))
    }

    async fn insert(&self, item: &Item) -> Result<()> {
        let mut uids = self.uids.lock().await;
        if uids.insert(item.uid.clone()) {
            self.items.lock().await.push(item.clone());
        }
        Ok(())
    }
}

/// Health store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryHealthStore {
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: HashMap<String, HealthRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn get(&self, source_id: &str) -> Option<HealthRecord> {
        self.records.lock().await.get(source_id).cloned()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn load(&self) -> Result<HashMap<String, HealthRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn save(&self, source_id: &str, record: &HealthRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(source_id.to_string(), record.clone());
        Ok(())
    }
}
