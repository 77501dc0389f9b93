//! OS credential store backend.
//!
//! - macOS / iOS: Keychain generic password items via `security-framework`,
//!   created with after-first-unlock, this-device-only accessibility
//! - Windows: Credential Manager via `keyring`
//! - Linux: kernel keyutils via `keyring`
//!
//! Each key is its own credential item, identified by service = namespace and
//! account = key.

use std::sync::Arc;

use securekv_core::storage::{
    Namespace, ProviderError, SecureStoreProvider, StorageError, StoreHandle,
};
use tracing::{debug, instrument};

/// Account used to check that the store is reachable. Never written.
const PROBE_ACCOUNT: &str = "securekv.probe";

pub struct KeychainProvider {
    namespace: Namespace,
}

impl KeychainProvider {
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }
}

impl SecureStoreProvider for KeychainProvider {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[instrument(skip_all, fields(namespace = %self.namespace))]
    fn acquire(&self) -> Result<Arc<dyn StoreHandle>, ProviderError> {
        native::probe(self.namespace.as_str())?;
        debug!("credential store reachable");
        Ok(Arc::new(KeychainHandle {
            service: self.namespace.as_str().to_string(),
        }))
    }
}

struct KeychainHandle {
    service: String,
}

impl StoreHandle for KeychainHandle {
    #[instrument(skip_all)]
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        native::write(&self.service, key, value)
    }

    #[instrument(skip_all)]
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        native::read(&self.service, key)
    }

    #[instrument(skip_all)]
    fn delete(&self, key: &str) -> Result<(), StorageError> {
        native::delete(&self.service, key)
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod native {
    use securekv_core::storage::{Operation, ProviderError, StorageError};
    use security_framework::{
        access_control::{ProtectionMode, SecAccessControl},
        base::Error,
        passwords::{
            delete_generic_password, get_generic_password, set_generic_password_options,
            PasswordOptions,
        },
    };

    use super::PROBE_ACCOUNT;

    const ERR_SEC_USER_CANCELED: i32 = -128;
    const ERR_SEC_AUTH_FAILED: i32 = -25293;
    const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;
    const ERR_SEC_INTERACTION_NOT_ALLOWED: i32 = -25308;

    pub(super) fn probe(service: &str) -> Result<(), ProviderError> {
        match get_generic_password(service, PROBE_ACCOUNT) {
            Ok(_) => Ok(()),
            Err(err) if err.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(err) => Err(provider_error(&err)),
        }
    }

    // Items are replaced rather than updated, so every write carries the
    // accessibility class regardless of how the old item was created.
    pub(super) fn write(service: &str, key: &str, value: &str) -> Result<(), StorageError> {
        delete(service, key)
            .map_err(|err| retag(err, Operation::Write))?;

        let access = SecAccessControl::create_with_protection(
            Some(ProtectionMode::AccessibleAfterFirstUnlockThisDeviceOnly),
            0,
        )
        .map_err(|err| status(Operation::Write, &err))?;
        let mut options = PasswordOptions::new_generic_password(service, key);
        options.set_access_control(access);
        set_generic_password_options(value.as_bytes(), options)
            .map_err(|err| status(Operation::Write, &err))
    }

    pub(super) fn read(service: &str, key: &str) -> Result<Option<String>, StorageError> {
        match get_generic_password(service, key) {
            Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|err| {
                StorageError::backend(Operation::Read, format!("value is not UTF-8: {err}"))
            }),
            Err(err) if err.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(err) => Err(status(Operation::Read, &err)),
        }
    }

    pub(super) fn delete(service: &str, key: &str) -> Result<(), StorageError> {
        match delete_generic_password(service, key) {
            Ok(()) => Ok(()),
            Err(err) if err.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(err) => Err(status(Operation::Delete, &err)),
        }
    }

    fn status(operation: Operation, err: &Error) -> StorageError {
        StorageError::backend(operation, format!("{err} (OSStatus {})", err.code()))
    }

    fn retag(err: StorageError, operation: Operation) -> StorageError {
        match err {
            StorageError::Backend { status, .. } => StorageError::Backend { operation, status },
            other => other,
        }
    }

    fn provider_error(err: &Error) -> ProviderError {
        let reason = format!("{err} (OSStatus {})", err.code());
        match err.code() {
            ERR_SEC_USER_CANCELED | ERR_SEC_AUTH_FAILED | ERR_SEC_INTERACTION_NOT_ALLOWED => {
                ProviderError::AccessDenied { reason }
            }
            _ => ProviderError::Unavailable { reason },
        }
    }

}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
mod native {
    use keyring::Entry;
    use securekv_core::storage::{Operation, ProviderError, StorageError};

    use super::PROBE_ACCOUNT;

    pub(super) fn probe(service: &str) -> Result<(), ProviderError> {
        let probe = Entry::new(service, PROBE_ACCOUNT).map_err(provider_error)?;
        match probe.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(provider_error(err)),
        }
    }

    fn entry(operation: Operation, service: &str, key: &str) -> Result<Entry, StorageError> {
        Entry::new(service, key).map_err(|err| StorageError::backend(operation, err))
    }

    pub(super) fn write(service: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let entry = entry(Operation::Write, service, key)?;
        // Credential items are replaced, not updated in place.
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(err) => return Err(StorageError::backend(Operation::Write, err)),
        }
        entry
            .set_password(value)
            .map_err(|err| StorageError::backend(Operation::Write, err))
    }

    // More than one matching item surfaces as `Ambiguous`.
    pub(super) fn read(service: &str, key: &str) -> Result<Option<String>, StorageError> {
        let entry = entry(Operation::Read, service, key)?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(StorageError::backend(Operation::Read, err)),
        }
    }

    pub(super) fn delete(service: &str, key: &str) -> Result<(), StorageError> {
        let entry = entry(Operation::Delete, service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StorageError::backend(Operation::Delete, err)),
        }
    }

    pub(super) fn provider_error(err: keyring::Error) -> ProviderError {
        match err {
            keyring::Error::NoStorageAccess(inner) => ProviderError::AccessDenied {
                reason: inner.to_string(),
            },
            other => ProviderError::Unavailable {
                reason: other.to_string(),
            },
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    // On Apple targets this also exercises the access-controlled item path.
    #[test]
    #[ignore] // Requires access to the real OS credential store
    fn keychain_round_trip() {
        let provider = KeychainProvider::new(Namespace::new("securekv.test").expect("namespace"));
        let handle = provider.acquire().expect("acquire");

        handle.write("token", "abc123").expect("write");
        handle.write("token", "def456").expect("overwrite");
        assert_eq!(handle.read("token").expect("read").as_deref(), Some("def456"));

        handle.delete("token").expect("delete");
        handle.delete("token").expect("delete again");
        assert_eq!(handle.read("token").expect("read after delete"), None);
    }
}
