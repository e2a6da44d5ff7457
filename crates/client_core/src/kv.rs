use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use storage::Storage;
use tokio::sync::Mutex;

/// Durable string key-value persistence the session is saved to.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Writes all entries or none of them.
    async fn put_all(&self, entries: &[(&str, &str)]) -> Result<()>;
    async fn remove_all(&self, keys: &[&str]) -> Result<()>;
}

#[async_trait]
impl KeyValueStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Storage::get(self, key).await
    }

    async fn put_all(&self, entries: &[(&str, &str)]) -> Result<()> {
        self.put_many(entries).await
    }

    async fn remove_all(&self, keys: &[&str]) -> Result<()> {
        self.remove_many(keys).await.map(|_| ())
    }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put_all(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut guard = self.entries.lock().await;
        for (key, value) in entries {
            guard.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }

    async fn remove_all(&self, keys: &[&str]) -> Result<()> {
        let mut guard = self.entries.lock().await;
        for key in keys {
            guard.remove(*key);
        }
        Ok(())
    }
}
