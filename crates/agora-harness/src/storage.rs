//! In-memory blob store and snapshot record store

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use agora_core::{BlobStore, SessionId, SnapshotRecord, SnapshotRecordStore, StorageError};

// ----------------------------------------------------------------------------
// Memory Blob Store
// ----------------------------------------------------------------------------

/// Content-addressed in-memory blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, StorageError> {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let cid = hex::encode(hasher.finalize());
        self.lock().insert(cid.clone(), bytes);
        Ok(cid)
    }

    async fn download(&self, cid: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(cid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                cid: cid.to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Memory Record Store
// ----------------------------------------------------------------------------

/// In-memory last-published snapshot records
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<SessionId, SnapshotRecord>>,
}

impl MemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotRecordStore for MemoryRecordStore {
    fn load(&self, session: &SessionId) -> Option<SnapshotRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session)
            .cloned()
    }

    fn store(&self, session: &SessionId, record: SnapshotRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.clone(), record);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_round_trip() {
        let store = MemoryBlobStore::new();
        let cid = store.upload(vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.download(&cid).await.unwrap(), vec![1, 2, 3]);
        assert!(store.download("missing").await.is_err());
    }
}
