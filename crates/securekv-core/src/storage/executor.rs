use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use super::{
    Namespace, Operation, SecureStoreError, SecureStoreProvider, StorageError, StoreHandle,
};

/// Process-scoped context performing write/read/delete against a lazily
/// acquired handle.
///
/// The handle lock is held for the whole of each operation, so calls are
/// serialized: two racing calls on the same key resolve to the order in which
/// they took the lock. A failed acquisition is not cached; the next call tries
/// again.
pub struct Executor {
    provider: Arc<dyn SecureStoreProvider>,
    handle: Mutex<Option<Arc<dyn StoreHandle>>>,
}

impl Executor {
    pub fn new(provider: Arc<dyn SecureStoreProvider>) -> Self {
        Self {
            provider,
            handle: Mutex::new(None),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn namespace(&self) -> &Namespace {
        self.provider.namespace()
    }

    /// Upsert `value` under `key`.
    #[instrument(skip_all, fields(backend = self.provider.name(), key))]
    pub fn write(&self, key: &str, value: &str) -> Result<(), SecureStoreError> {
        validate_key(key)?;
        self.with_handle(Operation::Write, |handle| handle.write(key, value))
    }

    /// Fetch the value for `key`; `Ok(None)` when nothing is stored.
    #[instrument(skip_all, fields(backend = self.provider.name(), key))]
    pub fn read(&self, key: &str) -> Result<Option<String>, SecureStoreError> {
        validate_key(key)?;
        self.with_handle(Operation::Read, |handle| handle.read(key))
    }

    /// Remove `key`. Removing an absent key succeeds.
    #[instrument(skip_all, fields(backend = self.provider.name(), key))]
    pub fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        validate_key(key)?;
        self.with_handle(Operation::Delete, |handle| handle.delete(key))
    }

    fn with_handle<T>(
        &self,
        operation: Operation,
        op: impl FnOnce(&dyn StoreHandle) -> Result<T, StorageError>,
    ) -> Result<T, SecureStoreError> {
        let mut slot = self.handle.lock().map_err(|err| {
            StorageError::backend(operation, format!("handle lock poisoned: {err}"))
        })?;

        let handle = match slot.as_ref() {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = self.provider.acquire().map_err(|err| {
                    warn!(%err, "secure store acquisition failed");
                    err
                })?;
                debug!(namespace = %self.provider.namespace(), "secure store handle acquired");
                *slot = Some(Arc::clone(&handle));
                handle
            }
        };

        op(handle.as_ref()).map_err(|err| {
            warn!(%err, %operation, "secure store operation failed");
            SecureStoreError::from(err)
        })
    }
}

fn validate_key(key: &str) -> Result<(), SecureStoreError> {
    if key.is_empty() {
        return Err(SecureStoreError::invalid_argument("Key must not be empty"));
    }
    Ok(())
}
