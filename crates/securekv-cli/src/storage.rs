use std::{path::PathBuf, sync::Arc};

use crate::config::{BackendKind, Config};
use color_eyre::Result;
use dirs::data_dir;
use securekv_core::storage::{InMemoryProvider, Namespace, SecureStoreProvider};
use securekv_storage::{
    key_provider::KeyringProvider, keychain::KeychainProvider,
    preferences::EncryptedPreferencesProvider,
};
use tracing::{debug, warn};

/// Resolve the default data directory for encrypted preferences.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("securekv"))
}

/// Build the provider selected by config. Nothing touches the OS store until
/// the first operation acquires a handle.
pub fn provider_from_config(config: &Config) -> Result<Arc<dyn SecureStoreProvider>> {
    let namespace = Namespace::new(config.namespace())?;
    let provider: Arc<dyn SecureStoreProvider> = match config.backend() {
        BackendKind::Keychain => {
            debug!(%namespace, "using OS credential store");
            Arc::new(KeychainProvider::new(namespace))
        }
        BackendKind::EncryptedPreferences => {
            let root = match &config.data_dir {
                Some(root) => root.clone(),
                None => default_data_dir()?,
            };
            debug!(%namespace, ?root, "using encrypted preferences");
            let keys = KeyringProvider::for_namespace(&namespace);
            Arc::new(EncryptedPreferencesProvider::new(namespace, root, keys))
        }
        BackendKind::Memory => {
            warn!("memory backend selected; values are lost on exit");
            Arc::new(InMemoryProvider::new(namespace))
        }
    };
    Ok(provider)
}
