use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fs2::FileExt;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use securekv_core::storage::{
    Namespace, Operation, ProviderError, SecureStoreProvider, StorageError, StoreHandle,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::key_provider::{KeyMaterial, KeyProvider};

type HmacSha256 = Hmac<Sha256>;

const FORMAT_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;
const LOOKUP_INFO: &[u8] = b"securekv/preferences/lookup-v1";
const VALUE_INFO: &[u8] = b"securekv/preferences/value-v1";

/// Encrypted preferences file protected by a master key from a [`KeyProvider`].
///
/// Entry keys are replaced by an HMAC-SHA256 lookup id (deterministic, so the
/// same key always finds its entry); values are sealed with AES-256-GCM under
/// a fresh nonce, bound to their lookup id as associated data. Both subkeys are
/// derived from the master key with HKDF-SHA256, salted by the namespace.
pub struct EncryptedPreferencesProvider<P: KeyProvider> {
    namespace: Namespace,
    root: PathBuf,
    key_provider: P,
}

impl<P: KeyProvider> EncryptedPreferencesProvider<P> {
    pub fn new(namespace: Namespace, root: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            namespace,
            root: root.into(),
            key_provider,
        }
    }

    /// File holding this namespace's entries.
    pub fn path(&self) -> PathBuf {
        self.root
            .join(format!("{}.prefs.json", self.namespace.as_str()))
    }

    /// Sidecar file locked around every access to [`Self::path`].
    pub fn lock_path(&self) -> PathBuf {
        self.root
            .join(format!("{}.prefs.lock", self.namespace.as_str()))
    }
}

impl<P: KeyProvider> SecureStoreProvider for EncryptedPreferencesProvider<P> {
    fn name(&self) -> &'static str {
        "encrypted-preferences"
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[instrument(skip_all, fields(namespace = %self.namespace))]
    fn acquire(&self) -> Result<Arc<dyn StoreHandle>, ProviderError> {
        fs::create_dir_all(&self.root).map_err(|e| ProviderError::Io {
            reason: format!("create {}: {e}", self.root.display()),
        })?;

        let master = self.key_provider.get_or_create()?;
        let handle = PreferencesHandle {
            path: self.path(),
            lock_path: self.lock_path(),
            keys: SubKeys::derive(&master, &self.namespace)?,
        };

        // Refuse to hand out a handle onto a file we could never read back.
        let _lock = FileLock::shared(&handle.lock_path).map_err(|e| ProviderError::Io {
            reason: format!("lock {}: {e}", handle.lock_path.display()),
        })?;
        load_file(&handle.path).map_err(|err| match err {
            LoadError::Io(reason) => ProviderError::Io { reason },
            LoadError::Malformed(reason) => ProviderError::Corrupted { reason },
        })?;
        debug!(path = %handle.path.display(), "preferences store opened");
        Ok(Arc::new(handle))
    }
}

struct SubKeys {
    lookup: Zeroizing<[u8; 32]>,
    cipher: Aes256Gcm,
}

impl SubKeys {
    fn derive(master: &KeyMaterial, namespace: &Namespace) -> Result<Self, ProviderError> {
        let hk = Hkdf::<Sha256>::new(Some(namespace.as_str().as_bytes()), &master.bytes);
        let mut lookup = Zeroizing::new([0u8; 32]);
        let mut value = Zeroizing::new([0u8; 32]);
        for (info, out) in [(LOOKUP_INFO, &mut lookup), (VALUE_INFO, &mut value)] {
            hk.expand(info, out.as_mut_slice())
                .map_err(|e| ProviderError::KeyMaterial {
                    reason: format!("subkey derivation failed: {e}"),
                })?;
        }

        let cipher = <Aes256Gcm as KeyInit>::new_from_slice(value.as_slice()).map_err(|e| {
            ProviderError::KeyMaterial {
                reason: format!("cipher init failed: {e}"),
            }
        })?;
        Ok(Self { lookup, cipher })
    }

    fn lookup_id(&self, operation: Operation, key: &str) -> Result<String, StorageError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.lookup.as_slice())
            .map_err(|e| StorageError::backend(operation, e))?;
        mac.update(key.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn seal(&self, entry_id: &str, value: &str) -> Result<StoredBlob, StorageError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: value.as_bytes(),
                    aad: entry_id.as_bytes(),
                },
            )
            .map_err(|e| StorageError::backend(Operation::Write, format!("encrypt failed: {e}")))?;

        Ok(StoredBlob {
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        })
    }

    fn open(&self, entry_id: &str, blob: &StoredBlob) -> Result<String, StorageError> {
        let read_err = |reason: String| StorageError::backend(Operation::Read, reason);

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(&blob.nonce)
            .map_err(|e| read_err(format!("nonce decode failed: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(read_err(format!(
                "nonce has {} bytes, expected {NONCE_LEN}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&blob.ciphertext)
            .map_err(|e| read_err(format!("ciphertext decode failed: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: entry_id.as_bytes(),
                },
            )
            .map_err(|e| read_err(format!("decrypt failed: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| read_err(format!("value is not UTF-8: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PreferencesFile {
    version: u32,
    entries: BTreeMap<String, StoredBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBlob {
    nonce: String,
    ciphertext: String,
}

struct PreferencesHandle {
    path: PathBuf,
    lock_path: PathBuf,
    keys: SubKeys,
}

impl PreferencesHandle {
    fn load(&self, operation: Operation) -> Result<PreferencesFile, StorageError> {
        load_file(&self.path).map_err(|err| StorageError::backend(operation, err))
    }

    fn lock(&self, operation: Operation) -> Result<FileLock, StorageError> {
        let lock = match operation {
            Operation::Read => FileLock::shared(&self.lock_path),
            Operation::Write | Operation::Delete => FileLock::exclusive(&self.lock_path),
        };
        lock.map_err(|e| StorageError::backend(operation, format!("lock failed: {e}")))
    }
}

impl StoreHandle for PreferencesHandle {
    // Other processes may hold handles on the same file, so each call locks the
    // sidecar from load until the rewritten file is in place.
    #[instrument(skip_all)]
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _lock = self.lock(Operation::Write)?;
        let mut file = self.load(Operation::Write)?;
        let entry_id = self.keys.lookup_id(Operation::Write, key)?;
        let blob = self.keys.seal(&entry_id, value)?;
        file.entries.insert(entry_id, blob);
        write_file(&self.path, &file).map_err(|e| StorageError::backend(Operation::Write, e))
    }

    #[instrument(skip_all)]
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _lock = self.lock(Operation::Read)?;
        let file = self.load(Operation::Read)?;
        let entry_id = self.keys.lookup_id(Operation::Read, key)?;
        file.entries
            .get(&entry_id)
            .map(|blob| self.keys.open(&entry_id, blob))
            .transpose()
    }

    #[instrument(skip_all)]
    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _lock = self.lock(Operation::Delete)?;
        let mut file = self.load(Operation::Delete)?;
        let entry_id = self.keys.lookup_id(Operation::Delete, key)?;
        if file.entries.remove(&entry_id).is_none() {
            return Ok(());
        }
        write_file(&self.path, &file).map_err(|e| StorageError::backend(Operation::Delete, e))
    }
}

/// Advisory lock on the sidecar file, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    fn shared(path: &Path) -> io::Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }

    fn exclusive(path: &Path) -> io::Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(error = %err, "preferences unlock failed");
        }
    }
}

#[derive(Debug)]
enum LoadError {
    Io(String),
    Malformed(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(reason) => write!(f, "i/o failure: {reason}"),
            LoadError::Malformed(reason) => write!(f, "store corrupted: {reason}"),
        }
    }
}

fn load_file(path: &Path) -> Result<PreferencesFile, LoadError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(PreferencesFile {
                version: FORMAT_VERSION,
                entries: BTreeMap::new(),
            })
        }
        Err(err) => return Err(LoadError::Io(err.to_string())),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| LoadError::Io(e.to_string()))?;
    let parsed: PreferencesFile =
        serde_json::from_slice(&buf).map_err(|e| LoadError::Malformed(e.to_string()))?;
    if parsed.version != FORMAT_VERSION {
        return Err(LoadError::Malformed(format!(
            "unsupported format version {}",
            parsed.version
        )));
    }
    Ok(parsed)
}

// Temp file + rename, so readers see either the old or the new file, never a mix.
fn write_file(path: &Path, contents: &PreferencesFile) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| "invalid storage path".to_string())?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| e.to_string())?;
    let json = serde_json::to_vec(contents).map_err(|e| e.to_string())?;
    tmp.write_all(&json).map_err(|e| e.to_string())?;
    tmp.flush().map_err(|e| e.to_string())?;
    tmp.persist(path).map_err(|e| e.error.to_string())?;
    debug!(entries = contents.entries.len(), "preferences file rewritten");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::{InMemoryKeyProvider, KeyError};

    fn provider(root: &Path, ns: &str) -> EncryptedPreferencesProvider<InMemoryKeyProvider> {
        EncryptedPreferencesProvider::new(
            Namespace::new(ns).expect("namespace"),
            root,
            InMemoryKeyProvider::default(),
        )
    }

    #[test]
    fn round_trip_encrypts_keys_and_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        let handle = provider.acquire().expect("acquire");

        handle.write("session-token", "hello-secret").expect("write");
        assert_eq!(
            handle.read("session-token").expect("read").as_deref(),
            Some("hello-secret")
        );

        let stored = fs::read_to_string(provider.path()).expect("read prefs file");
        assert!(!stored.contains("hello-secret"), "plaintext value on disk");
        assert!(!stored.contains("session-token"), "plaintext key on disk");
    }

    #[test]
    fn overwrite_replaces_single_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        let handle = provider.acquire().expect("acquire");

        handle.write("k", "v1").expect("first write");
        handle.write("k", "v2").expect("second write");

        assert_eq!(handle.read("k").expect("read").as_deref(), Some("v2"));
        let file = load_file(&provider.path()).expect("load");
        assert_eq!(file.entries.len(), 1);
    }

    #[test]
    fn lookup_is_deterministic_but_values_are_not() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        let handle = provider.acquire().expect("acquire");

        handle.write("k", "same").expect("first write");
        let first = load_file(&provider.path()).expect("load");
        handle.write("k", "same").expect("second write");
        let second = load_file(&provider.path()).expect("load");

        let ids: Vec<_> = first.entries.keys().collect();
        assert_eq!(ids, second.entries.keys().collect::<Vec<_>>());
        let id = ids[0];
        assert_ne!(
            first.entries[id].ciphertext, second.entries[id].ciphertext,
            "value encryption must use a fresh nonce"
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        let handle = provider.acquire().expect("acquire");

        handle.write("k", "v").expect("write");
        handle.delete("k").expect("delete");
        handle.delete("k").expect("delete again");
        assert_eq!(handle.read("k").expect("read"), None);
    }

    #[test]
    fn delete_on_fresh_store_creates_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        let handle = provider.acquire().expect("acquire");

        handle.delete("missing").expect("delete");
        assert!(!provider.path().exists());
    }

    #[test]
    fn namespaces_sharing_a_directory_are_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = InMemoryKeyProvider::default();
        let first = EncryptedPreferencesProvider::new(
            Namespace::new("app.one").expect("namespace"),
            dir.path(),
            keys.clone(),
        );
        let second = EncryptedPreferencesProvider::new(
            Namespace::new("app.two").expect("namespace"),
            dir.path(),
            keys,
        );

        first.acquire().expect("acquire").write("k", "one").expect("write");
        let other = second.acquire().expect("acquire");
        assert_eq!(other.read("k").expect("read"), None);
    }

    #[test]
    fn corrupted_file_fails_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        fs::write(provider.path(), b"{not json").expect("write garbage");

        let err = provider.acquire().err().expect("acquire should fail");
        assert!(matches!(err, ProviderError::Corrupted { .. }));
    }

    #[test]
    fn unknown_format_version_fails_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        fs::write(provider.path(), br#"{"version":9,"entries":{}}"#).expect("write");

        let err = provider.acquire().err().expect("acquire should fail");
        assert!(matches!(err, ProviderError::Corrupted { .. }));
    }

    #[test]
    fn wrong_master_key_cannot_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = provider(dir.path(), "com.example.app");
        writer
            .acquire()
            .expect("acquire")
            .write("k", "v")
            .expect("write");

        let blob = load_file(&writer.path()).expect("load");
        let reader = provider(dir.path(), "com.example.app");
        let reader_keys = SubKeys::derive(
            &reader.key_provider.get_or_create().expect("key"),
            reader.namespace(),
        )
        .expect("derive");
        let (id, stored) = blob.entries.iter().next().expect("one entry");
        let err = reader_keys.open(id, stored).expect_err("foreign key must fail");
        assert!(matches!(
            err,
            StorageError::Backend {
                operation: Operation::Read,
                ..
            }
        ));
    }

    #[test]
    fn swapped_ciphertext_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        let handle = provider.acquire().expect("acquire");
        handle.write("a", "1").expect("write a");
        handle.write("b", "2").expect("write b");

        let mut file = load_file(&provider.path()).expect("load");
        let ids: Vec<String> = file.entries.keys().cloned().collect();
        let first = file.entries[&ids[0]].clone();
        let second = file.entries[&ids[1]].clone();
        file.entries.insert(ids[0].clone(), second);
        file.entries.insert(ids[1].clone(), first);
        write_file(&provider.path(), &file).expect("rewrite");

        assert!(handle.read("a").is_err());
        assert!(handle.read("b").is_err());
    }

    #[test]
    fn handles_sharing_a_file_keep_every_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = InMemoryKeyProvider::default();
        let namespace = Namespace::new("com.example.app").expect("namespace");

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let root = dir.path().to_path_buf();
                let provider =
                    EncryptedPreferencesProvider::new(namespace.clone(), root, keys.clone());
                std::thread::spawn(move || {
                    let handle = provider.acquire().expect("acquire");
                    for n in 0..10 {
                        handle
                            .write(&format!("w{writer}-k{n}"), &format!("v{n}"))
                            .expect("write");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let handle = EncryptedPreferencesProvider::new(namespace, dir.path(), keys)
            .acquire()
            .expect("acquire");
        for writer in 0..8 {
            for n in 0..10 {
                assert_eq!(
                    handle.read(&format!("w{writer}-k{n}")).expect("read"),
                    Some(format!("v{n}")),
                    "lost write w{writer}-k{n}"
                );
            }
        }
    }

    #[test]
    fn lock_file_sits_beside_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = provider(dir.path(), "com.example.app");
        provider.acquire().expect("acquire").write("k", "v").expect("write");

        assert!(provider.lock_path().exists());
        assert_eq!(provider.lock_path().parent(), provider.path().parent());
        assert_eq!(fs::read(provider.lock_path()).expect("lock file"), b"");
    }

    struct DenyingKeys;

    impl KeyProvider for DenyingKeys {
        fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
            Err(KeyError::Keyring("user interaction not allowed".into()))
        }
    }

    #[test]
    fn key_provider_failure_fails_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = EncryptedPreferencesProvider::new(
            Namespace::new("com.example.app").expect("namespace"),
            dir.path(),
            DenyingKeys,
        );
        let err = provider.acquire().err().expect("acquire should fail");
        assert!(matches!(err, ProviderError::KeyMaterial { .. }));
    }
}
