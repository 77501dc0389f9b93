//! Secure storage contract shared by every backend.

mod error;
mod executor;
mod namespace;
mod secure_store;

pub use error::{Operation, ProviderError, SecureStoreError, StorageError};
pub use executor::Executor;
pub use namespace::Namespace;
pub use secure_store::{InMemoryProvider, SecureStoreProvider, StoreHandle};
