use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use securekv_core::storage::{Namespace, ProviderError};
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keyring account holding the master key of a namespace.
pub const MASTER_KEY_ACCOUNT: &str = "master-key";

/// Appended to the namespace to form the master key's keyring service. The
/// separator is not allowed in namespaces, so the keychain backend can never
/// address this entry.
pub const MASTER_KEY_SERVICE_SUFFIX: &str = "/preferences";

/// Master key protecting an encrypted preferences file.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Identifier for logging/rotation (never log key bytes).
    pub id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

impl From<KeyError> for ProviderError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Decode(reason) => ProviderError::Corrupted {
                reason: format!("master key: {reason}"),
            },
            other => ProviderError::KeyMaterial {
                reason: other.to_string(),
            },
        }
    }
}

/// Provides the master key (OS keychain in production; memory in tests).
pub trait KeyProvider: Send + Sync {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;
}

/// OS keyring-backed provider. Uses the `keyring` crate to store the key.
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    /// Master key entry for a namespace.
    pub fn for_namespace(namespace: &Namespace) -> Self {
        Self::new(
            format!("{}{MASTER_KEY_SERVICE_SUFFIX}", namespace.as_str()),
            MASTER_KEY_ACCOUNT,
        )
    }
}

impl KeyProvider for KeyringProvider {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let entry = keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;

        match entry.get_password() {
            Ok(secret) => decode_key(&secret),
            // Only a missing entry may mint a new key; anything else would
            // orphan the data encrypted under the existing one.
            Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service, "generating master key");
                let material = generate_key()?;
                entry
                    .set_password(&encode_key(&material))
                    .map_err(|e| KeyError::Keyring(e.to_string()))?;
                Ok(material)
            }
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl KeyProvider for InMemoryKeyProvider {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = generate_key()?;
        *guard = Some(material.clone());
        Ok(material)
    }
}

fn generate_key() -> Result<KeyMaterial, KeyError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyError::Generation(e.to_string()))?;
    Ok(KeyMaterial {
        id: "default".to_string(),
        bytes,
    })
}

fn encode_key(material: &KeyMaterial) -> String {
    general_purpose::STANDARD.encode(material.bytes)
}

fn decode_key(secret: &str) -> Result<KeyMaterial, KeyError> {
    let mut bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    if bytes.len() != 32 {
        let len = bytes.len();
        bytes.zeroize();
        return Err(KeyError::Decode(format!("expected 32 bytes, got {len}")));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(KeyMaterial {
        id: "default".to_string(),
        bytes: out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::default();
        let first = provider.get_or_create().unwrap();
        let second = provider.get_or_create().unwrap();

        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key("abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn encoded_key_decodes_to_same_bytes() {
        let material = generate_key().expect("generate");
        let decoded = decode_key(&encode_key(&material)).expect("decode");
        assert_eq!(decoded, material);
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let material = KeyMaterial {
            id: "default".into(),
            bytes: [7u8; 32],
        };
        let rendered = format!("{material:?}");
        assert!(!rendered.contains("bytes"));
    }

    #[test]
    fn master_key_service_is_outside_every_namespace() {
        let namespace = Namespace::new("com.example.app").expect("namespace");
        let provider = KeyringProvider::for_namespace(&namespace);

        assert_eq!(provider.service, "com.example.app/preferences");
        assert_eq!(provider.account, MASTER_KEY_ACCOUNT);
        assert!(Namespace::new(provider.service.clone()).is_err());
    }

    #[test]
    fn undecodable_key_maps_to_corrupted_store() {
        let err = ProviderError::from(KeyError::Decode("bad base64".into()));
        assert!(matches!(err, ProviderError::Corrupted { .. }));

        let err = ProviderError::from(KeyError::Keyring("locked".into()));
        assert!(matches!(err, ProviderError::KeyMaterial { .. }));
    }
}
