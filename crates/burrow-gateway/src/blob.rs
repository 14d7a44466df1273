//! Seat for the encrypted share-blob store.
//!
//! The dashboard encrypts a captured exchange client-side and parks the
//! ciphertext here; the core only stores and serves opaque bytes. Persistent
//! implementations live outside the core; [`MemoryBlobStore`] is the
//! reference.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use burrow_core::{new_trace_id, TunnelResult};

/// How long a stored blob stays retrievable.
pub const DEFAULT_BLOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Storage seat for end-to-end-encrypted shared exchanges.
pub trait BlobStore: Send + Sync {
    /// Store ciphertext and return its id.
    fn save(&self, ciphertext: Vec<u8>) -> TunnelResult<String>;

    /// Fetch ciphertext by id. `None` when absent or expired.
    fn get(&self, id: &str) -> TunnelResult<Option<Vec<u8>>>;
}

struct StoredBlob {
    ciphertext: Vec<u8>,
    expires_at: Instant,
}

/// In-memory blob store with TTL expiry.
pub struct MemoryBlobStore {
    ttl: Duration,
    blobs: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_BLOB_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(&self, ciphertext: Vec<u8>) -> TunnelResult<String> {
        let id = new_trace_id();
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.insert(
            id.clone(),
            StoredBlob {
                ciphertext,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(id)
    }

    fn get(&self, id: &str) -> TunnelResult<Option<Vec<u8>>> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        match blobs.get(id) {
            Some(blob) if blob.expires_at > Instant::now() => Ok(Some(blob.ciphertext.clone())),
            Some(_) => {
                blobs.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_get() {
        let store = MemoryBlobStore::new();
        let id = store.save(b"ciphertext".to_vec()).unwrap();
        assert_eq!(id.len(), 26);
        assert_eq!(store.get(&id).unwrap(), Some(b"ciphertext".to_vec()));
    }

    #[test]
    fn unknown_id_is_absent() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap(), None);
    }

    #[test]
    fn expired_blob_is_absent() {
        let store = MemoryBlobStore::with_ttl(Duration::from_secs(0));
        let id = store.save(b"gone".to_vec()).unwrap();
        assert_eq!(store.get(&id).unwrap(), None);
    }
}
