//! In-memory resource store
//!
//! Keeps every generation in a map guarded by a lock. Nothing survives a
//! restart. Also serves as the store double in tests, where it can be
//! switched into an unavailable state.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{CachedEntry, GenerationHandle, RequestKey, ResourceStore, StoreError};

type Generations = HashMap<String, HashMap<RequestKey, CachedEntry>>;

/// Resource store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    /// Entries by generation name, then by request key
    generations: RwLock<Generations>,
    /// When set, every operation fails with `StoreError::Unavailable`
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away (or coming back)
    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store disabled".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Generations>, StoreError> {
        self.check_available()?;
        self.generations
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Generations>, StoreError> {
        self.check_available()?;
        self.generations
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn open(&self, name: &str) -> Result<GenerationHandle, StoreError> {
        self.write()?.entry(name.to_string()).or_default();
        Ok(GenerationHandle::new(name))
    }

    async fn get(
        &self,
        handle: &GenerationHandle,
        key: &RequestKey,
    ) -> Result<Option<CachedEntry>, StoreError> {
        let generations = self.read()?;
        Ok(generations
            .get(handle.name())
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, handle: &GenerationHandle, entry: CachedEntry) -> Result<(), StoreError> {
        let mut generations = self.write()?;
        match generations.get_mut(handle.name()) {
            Some(entries) => {
                entries.insert(entry.key.clone(), entry);
            }
            None => {
                debug!(generation = handle.name(), key = %entry.key, "Dropping write to deleted generation");
            }
        }
        Ok(())
    }

    async fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.write()?.remove(name).is_some())
    }

    async fn generation_names(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.read()?.keys().cloned().collect())
    }

    async fn entry_count(&self, handle: &GenerationHandle) -> Result<usize, StoreError> {
        Ok(self
            .read()?
            .get(handle.name())
            .map(HashMap::len)
            .unwrap_or(0))
    }
}
