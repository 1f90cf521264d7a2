//! In-process store with fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{PersistenceError, PersistenceStore};

/// `HashMap` behind a mutex. Clone-free; share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<Uuid, Vec<u8>>>,
    failing_saves: AtomicU64,
    failing_loads: AtomicU64,
    save_attempts: AtomicU64,
    saves: AtomicU64,
    loads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `save` fail with `Unavailable`.
    pub fn fail_next_saves(&self, n: u64) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to `load` fail with `Unavailable`.
    pub fn fail_next_loads(&self, n: u64) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// All save calls, failed ones included.
    pub fn save_attempts(&self) -> u64 {
        self.save_attempts.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Raw stored bytes, bypassing fault injection.
    pub fn get(&self, doc_id: Uuid) -> Option<Vec<u8>> {
        self.lock().get(&doc_id).cloned()
    }

    /// Store bytes directly, bypassing fault injection.
    pub fn put(&self, doc_id: Uuid, bytes: Vec<u8>) {
        self.lock().insert(doc_id, bytes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<u8>>> {
        // A poisoned map still holds whole blobs; keep serving it.
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_loads) {
            return Err(PersistenceError::Unavailable("injected load failure".into()));
        }
        Ok(self.get(doc_id))
    }

    async fn save(&self, doc_id: Uuid, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_saves) {
            return Err(PersistenceError::Unavailable("injected save failure".into()));
        }
        self.put(doc_id, bytes.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
