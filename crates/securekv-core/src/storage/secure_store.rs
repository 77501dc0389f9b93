use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use super::{Namespace, Operation, ProviderError, StorageError};

/// Produces handles onto an OS-backed encrypted store bound to one namespace.
pub trait SecureStoreProvider: Send + Sync {
    /// Short backend name used for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Namespace scoping every key written through this provider.
    fn namespace(&self) -> &Namespace;

    /// Obtain a usable handle. Calling this twice is equivalent to calling it once.
    fn acquire(&self) -> Result<Arc<dyn StoreHandle>, ProviderError>;
}

/// Operations against an acquired store. Implementations translate native
/// statuses into [`StorageError`] and never report "not found" as a failure.
pub trait StoreHandle: Send + Sync {
    /// Upsert a value, replacing any existing entry.
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Fetch the decrypted value, or `None` when the key is absent.
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Remove a key (idempotent).
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory provider that simulates encryption for tests and smoke runs.
/// This is not cryptographically secure; it only keeps values from sitting in
/// the map as plaintext.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    namespace: Namespace,
    state: Arc<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    deny_access: AtomicBool,
    failing_status: Mutex<Option<String>>,
    acquisitions: AtomicUsize,
    backend_calls: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            state: Arc::default(),
        }
    }

    /// Make every subsequent `acquire` fail as if the OS denied access.
    pub fn deny_access(&self, deny: bool) {
        self.state.deny_access.store(deny, Ordering::SeqCst);
    }

    /// Make every write/read/delete on acquired handles fail with `status`,
    /// as a native store returning an error code would. `None` restores them.
    pub fn fail_operations(&self, status: Option<&str>) {
        if let Ok(mut failing) = self.state.failing_status.lock() {
            *failing = status.map(str::to_string);
        }
    }

    /// Number of successful acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.state.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of write/read/delete calls that reached the store.
    pub fn backend_calls(&self) -> usize {
        self.state.backend_calls.load(Ordering::SeqCst)
    }
}

impl SecureStoreProvider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn acquire(&self) -> Result<Arc<dyn StoreHandle>, ProviderError> {
        if self.state.deny_access.load(Ordering::SeqCst) {
            return Err(ProviderError::AccessDenied {
                reason: "simulated denial".to_string(),
            });
        }
        self.state.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryHandle {
    state: Arc<MemoryState>,
}

impl InMemoryHandle {
    fn entries(
        &self,
        operation: Operation,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StorageError> {
        self.state.backend_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .state
            .failing_status
            .lock()
            .map_err(|err| StorageError::backend(operation, format!("lock poisoned: {err}")))?
            .clone();
        if let Some(status) = failing {
            return Err(StorageError::backend(operation, status));
        }
        self.state
            .entries
            .lock()
            .map_err(|err| StorageError::backend(operation, format!("lock poisoned: {err}")))
    }
}

impl StoreHandle for InMemoryHandle {
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut map = self.entries(Operation::Write)?;
        // XOR is a placeholder to avoid holding plaintext in the map.
        map.insert(key.to_string(), mask(value.as_bytes()));
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let map = self.entries(Operation::Read)?;
        map.get(key)
            .map(|masked| {
                String::from_utf8(mask(masked))
                    .map_err(|err| StorageError::backend(Operation::Read, err))
            })
            .transpose()
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut map = self.entries(Operation::Delete)?;
        map.remove(key);
        Ok(())
    }
}

const MASK_BYTE: u8 = 0xA5;

// XOR is its own inverse, so this both masks and unmasks.
fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InMemoryProvider {
        InMemoryProvider::new(Namespace::new("test.memory").expect("namespace"))
    }

    #[test]
    fn round_trip_masks_and_unmasks() {
        let provider = provider();
        let handle = provider.acquire().expect("acquire");
        handle.write("agent/session", "top-secret").expect("write");

        assert_eq!(
            handle.read("agent/session").expect("read").as_deref(),
            Some("top-secret")
        );
        // Ensure we are not holding plaintext.
        let map = provider.state.entries.lock().expect("lock");
        assert_ne!(map.get("agent/session").unwrap(), b"top-secret");
    }

    #[test]
    fn handles_share_one_store() {
        let provider = provider();
        let first = provider.acquire().expect("first acquire");
        let second = provider.acquire().expect("second acquire");

        first.write("k", "v").expect("write");
        assert_eq!(second.read("k").expect("read").as_deref(), Some("v"));
        assert_eq!(provider.acquisitions(), 2);
    }

    #[test]
    fn failing_operations_report_their_operation() {
        let provider = provider();
        let handle = provider.acquire().expect("acquire");
        handle.write("k", "v").expect("write");

        provider.fail_operations(Some("errSecIO"));
        assert_eq!(
            handle.read("k").expect_err("read"),
            StorageError::backend(Operation::Read, "errSecIO")
        );
        assert_eq!(
            handle.delete("k").expect_err("delete"),
            StorageError::backend(Operation::Delete, "errSecIO")
        );

        provider.fail_operations(None);
        assert_eq!(handle.read("k").expect("read").as_deref(), Some("v"));
    }

    #[test]
    fn denied_access_fails_acquire() {
        let provider = provider();
        provider.deny_access(true);
        let err = provider.acquire().err().expect("acquire should fail");
        assert!(matches!(err, ProviderError::AccessDenied { .. }));
        assert_eq!(provider.acquisitions(), 0);
    }
}
