//! In-memory session store for embedding and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionStore, StoreError};
use crate::core::MatchId;

/// Session store backed by a map.
#[derive(Default)]
pub struct MemorySessionStore {
    rows: RwLock<BTreeMap<MatchId, Vec<u8>>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly (what match creation does upstream).
    pub async fn insert(&self, match_id: MatchId, blob: impl Into<Vec<u8>>) {
        self.rows.write().await.insert(match_id, blob.into());
    }

    /// Read a row without counting it as a load.
    pub async fn get(&self, match_id: MatchId) -> Option<Vec<u8>> {
        self.rows.read().await.get(&match_id).cloned()
    }

    /// Number of `load` calls served.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of `save` calls served.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, match_id: MatchId) -> Result<Option<Vec<u8>>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.rows.read().await.get(&match_id).cloned())
    }

    async fn save(&self, match_id: MatchId, blob: &[u8]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.rows.write().await.insert(match_id, blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_row() {
        let store = MemorySessionStore::new();
        assert!(store.load(MatchId::new(1)).await.unwrap().is_none());
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemorySessionStore::new();
        store.save(MatchId::new(1), b"{}").await.unwrap();

        assert_eq!(store.load(MatchId::new(1)).await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.save_count(), 1);
    }
}
