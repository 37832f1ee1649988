//! The local file keystore backend.
//!
//! Lifecycle: Cold → `initialize_master_key` → Unlocked → `scan` →
//! Ready. Reads for a specific address require Ready; `store` requires
//! Unlocked. `teardown` returns the backend to Cold from any state.
//!
//! The in-memory cache is guarded by a reader/writer lock. Readers
//! (list, get, metadata, public-info, export) copy what they need out
//! of the cache and release the lock before any blocking decryption.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use aplane_envelope::{
    is_encrypted, open_with_master_key, seal_with_master_key, SecureBuffer, MASTER_KEY_LEN,
};

use crate::error::KeystoreError;
use crate::fsutil;
use crate::metadata::{master_key_bytes, KeystoreMetadata};
use crate::provider::{KeyMaterial, KeyMaterialValue};
use crate::registry::Registry;
use crate::types::{
    KeyMetadata, KeyRecord, PublicKeyInfo, StoreLayout, KEY_FILE_EXT, KEY_TYPE_UNKNOWN,
};

// ---------------------------------------------------------------------------
// KeyStore interface
// ---------------------------------------------------------------------------

/// Backend-agnostic keystore surface. The file backend below is the
/// only implementation shipped; alternate backends slot in here.
pub trait KeyStore: Send + Sync {
    /// Verify `passphrase` against the store metadata and cache the
    /// derived master key, wiping any previously cached key.
    fn initialize_master_key(&self, passphrase: &[u8]) -> Result<(), KeystoreError>;

    /// Decrypt every key record once and populate the metadata cache.
    /// Returns the number of keys catalogued.
    fn scan(&self) -> Result<usize, KeystoreError>;

    fn list(&self) -> Result<Vec<KeyMetadata>, KeystoreError>;

    /// Decrypt one record and produce usable signing material.
    fn get(&self, address: &str) -> Result<KeyMaterial, KeystoreError>;

    /// Cached metadata only; never decrypts.
    fn get_metadata(&self, address: &str) -> Result<KeyMetadata, KeystoreError>;

    fn get_public_key_info(&self, address: &str) -> Result<PublicKeyInfo, KeystoreError>;

    fn get_all_public_key_info(&self) -> Result<Vec<PublicKeyInfo>, KeystoreError>;

    /// Encrypt `plaintext` under the master key and write a fresh
    /// record. Refuses addresses already present in cache or on disk.
    fn store(&self, address: &str, plaintext: &[u8]) -> Result<PathBuf, KeystoreError>;

    /// Remove a key from cache and disk; a missing file is tolerated.
    fn delete(&self, address: &str) -> Result<(), KeystoreError>;

    /// The encrypted record bytes, as stored.
    fn export(&self, address: &str) -> Result<Vec<u8>, KeystoreError>;

    /// Wipe the master key and drop the cache.
    fn teardown(&self);

    fn is_unlocked(&self) -> bool;

    fn is_scanned(&self) -> bool;

    /// A wiped-on-drop copy of the cached master key.
    fn master_key(&self) -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>, KeystoreError>;
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct CachedKey {
    key_type: String,
    public_key_hex: String,
    lsig_bytecode_hex: Option<String>,
    created_at: DateTime<Utc>,
    file_path: PathBuf,
}

#[derive(Default)]
struct StoreState {
    master_key: Option<SecureBuffer>,
    scanned: bool,
    cache: HashMap<String, CachedKey>,
    /// Directory insertion order of addresses.
    order: Vec<String>,
}

pub struct FileKeyStore {
    layout: StoreLayout,
    registry: Arc<Registry>,
    state: RwLock<StoreState>,
}

impl FileKeyStore {
    pub fn new(layout: StoreLayout, registry: Arc<Registry>) -> Self {
        Self {
            layout,
            registry,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, address: &str) -> Result<CachedKey, KeystoreError> {
        let state = self.read_state();
        if state.master_key.is_none() {
            return Err(KeystoreError::StoreLocked);
        }
        if !state.scanned {
            return Err(KeystoreError::NotScanned);
        }
        state
            .cache
            .get(address)
            .cloned()
            .ok_or_else(|| KeystoreError::KeyNotFound(address.to_string()))
    }

    fn metadata_of(&self, address: &str, entry: &CachedKey) -> KeyMetadata {
        KeyMetadata {
            address: address.to_string(),
            key_type: entry.key_type.clone(),
            created_at: entry.created_at,
            storage_type: "file".into(),
            exportable: true,
            file_path: entry.file_path.clone(),
        }
    }

    fn public_info_of(&self, address: &str, entry: &CachedKey) -> PublicKeyInfo {
        PublicKeyInfo {
            address: address.to_string(),
            key_type: entry.key_type.clone(),
            public_key_hex: entry.public_key_hex.clone(),
            lsig_bytecode_hex: entry.lsig_bytecode_hex.clone(),
            lsig_size: entry
                .lsig_bytecode_hex
                .as_deref()
                .map(|h| h.len() / 2)
                .unwrap_or(0),
        }
    }

    fn cache_entry_from_record(
        record: &KeyRecord,
        path: PathBuf,
        fallback_created: DateTime<Utc>,
    ) -> CachedKey {
        CachedKey {
            key_type: record.key_type.clone(),
            public_key_hex: record.public_key.clone(),
            lsig_bytecode_hex: record.lsig_bytecode.clone(),
            created_at: record.created_at.unwrap_or(fallback_created),
            file_path: path,
        }
    }

    fn file_mtime(path: &std::path::Path) -> DateTime<Utc> {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now())
    }
}

impl KeyStore for FileKeyStore {
    fn initialize_master_key(&self, passphrase: &[u8]) -> Result<(), KeystoreError> {
        let meta = KeystoreMetadata::load(self.layout.root())?
            .ok_or(KeystoreError::NotInitialized)?;
        // KDF runs before the lock is taken; only the install is a write.
        let master_key = meta.verify_and_derive(passphrase)?;

        let mut state = self.write_state();
        if let Some(old) = state.master_key.take() {
            old.destroy();
        }
        state.master_key = Some(master_key);
        state.scanned = false;
        state.cache.clear();
        state.order.clear();

        tracing::debug!(root = %self.layout.root().display(), "master key initialized");
        Ok(())
    }

    fn scan(&self) -> Result<usize, KeystoreError> {
        let mut state = self.write_state();
        let key = match &state.master_key {
            Some(buf) => master_key_bytes(buf)?,
            None => return Err(KeystoreError::StoreLocked),
        };

        let mut cache = HashMap::new();
        let mut order = Vec::new();

        let keys_dir = self.layout.keys_dir();
        match std::fs::read_dir(&keys_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry
                        .map_err(|e| KeystoreError::io(format!("scan {}", keys_dir.display()), e))?;
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(KEY_FILE_EXT) {
                        continue;
                    }
                    let Some(address) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };

                    let bytes = std::fs::read(&path)
                        .map_err(|e| KeystoreError::io(format!("read {}", path.display()), e))?;
                    let plaintext = open_with_master_key(&bytes, &key).map_err(|e| {
                        tracing::error!(file = %path.display(), "key record failed to open");
                        KeystoreError::from(e)
                    })?;

                    let created = Self::file_mtime(&path);
                    let entry = match KeyRecord::from_slice(&plaintext) {
                        Ok(record) => Self::cache_entry_from_record(&record, path.clone(), created),
                        Err(e) => {
                            // An opaque payload stays listed but unusable.
                            tracing::warn!(file = %path.display(), error = %e, "unparseable key record");
                            CachedKey {
                                key_type: KEY_TYPE_UNKNOWN.into(),
                                public_key_hex: String::new(),
                                lsig_bytecode_hex: None,
                                created_at: created,
                                file_path: path.clone(),
                            }
                        }
                    };
                    cache.insert(address.to_string(), entry);
                    order.push(address.to_string());
                    // plaintext wiped here on drop
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KeystoreError::io(format!("scan {}", keys_dir.display()), e)),
        }

        let count = order.len();
        state.cache = cache;
        state.order = order;
        state.scanned = true;
        tracing::info!(keys = count, "keystore scan complete");
        Ok(count)
    }

    fn list(&self) -> Result<Vec<KeyMetadata>, KeystoreError> {
        let state = self.read_state();
        if state.master_key.is_none() {
            return Err(KeystoreError::StoreLocked);
        }
        if !state.scanned {
            return Err(KeystoreError::NotScanned);
        }
        Ok(state
            .order
            .iter()
            .filter_map(|addr| state.cache.get(addr).map(|e| self.metadata_of(addr, e)))
            .collect())
    }

    fn get(&self, address: &str) -> Result<KeyMaterial, KeystoreError> {
        let entry = self.cached(address)?;
        let key = self.master_key()?;

        let bytes = std::fs::read(&entry.file_path)
            .map_err(|e| KeystoreError::io(format!("read {}", entry.file_path.display()), e))?;
        let plaintext = open_with_master_key(&bytes, &key)?;

        if self.registry.is_generic_lsig(&entry.key_type) {
            let record = KeyRecord::from_slice(&plaintext)
                .map_err(|e| KeystoreError::Malformed(format!("key record: {}", e)))?;
            let bytecode_hex = record.lsig_bytecode.as_deref().ok_or_else(|| {
                KeystoreError::Malformed(format!(
                    "{} is a LogicSig type but the record has no bytecode",
                    entry.key_type
                ))
            })?;
            let bytecode = hex::decode(bytecode_hex)
                .map_err(|_| KeystoreError::Malformed("lsig bytecode is not valid hex".into()))?;
            return Ok(KeyMaterial {
                key_type: entry.key_type,
                value: KeyMaterialValue::GenericLsig { bytecode },
                bytecode: None,
            });
        }

        let provider = self
            .registry
            .provider(&entry.key_type)
            .ok_or_else(|| KeystoreError::NoProvider(entry.key_type.clone()))?;
        let mut material = provider.load_keys_from_data(&plaintext)?;

        if material.bytecode.is_none() {
            if let Some(hex_code) = entry.lsig_bytecode_hex.as_deref() {
                material.bytecode = Some(hex::decode(hex_code).map_err(|_| {
                    KeystoreError::Malformed("lsig bytecode is not valid hex".into())
                })?);
            }
        }
        Ok(material)
    }

    fn get_metadata(&self, address: &str) -> Result<KeyMetadata, KeystoreError> {
        let entry = self.cached(address)?;
        Ok(self.metadata_of(address, &entry))
    }

    fn get_public_key_info(&self, address: &str) -> Result<PublicKeyInfo, KeystoreError> {
        let entry = self.cached(address)?;
        Ok(self.public_info_of(address, &entry))
    }

    fn get_all_public_key_info(&self) -> Result<Vec<PublicKeyInfo>, KeystoreError> {
        let state = self.read_state();
        if state.master_key.is_none() {
            return Err(KeystoreError::StoreLocked);
        }
        if !state.scanned {
            return Err(KeystoreError::NotScanned);
        }
        Ok(state
            .order
            .iter()
            .filter_map(|addr| state.cache.get(addr).map(|e| self.public_info_of(addr, e)))
            .collect())
    }

    fn store(&self, address: &str, plaintext: &[u8]) -> Result<PathBuf, KeystoreError> {
        let path = self.layout.key_path(address);
        let sealed = {
            let state = self.read_state();
            let key = match &state.master_key {
                Some(buf) => master_key_bytes(buf)?,
                None => return Err(KeystoreError::StoreLocked),
            };
            if state.cache.contains_key(address) {
                return Err(KeystoreError::KeyExists(address.to_string()));
            }
            drop(state);
            seal_with_master_key(plaintext, &key)?
        };

        let mut state = self.write_state();
        if state.cache.contains_key(address) || path.exists() {
            return Err(KeystoreError::KeyExists(address.to_string()));
        }
        fsutil::atomic_write(&path, &sealed, fsutil::FILE_MODE_GROUP)
            .map_err(|e| KeystoreError::io(format!("write {}", path.display()), e))?;

        // Populate the cache from the plaintext when it parses; an
        // opaque payload stays "unknown" until the next scan.
        let entry = match KeyRecord::from_slice(plaintext) {
            Ok(record) => Self::cache_entry_from_record(&record, path.clone(), Utc::now()),
            Err(_) => CachedKey {
                key_type: KEY_TYPE_UNKNOWN.into(),
                public_key_hex: String::new(),
                lsig_bytecode_hex: None,
                created_at: Utc::now(),
                file_path: path.clone(),
            },
        };
        state.cache.insert(address.to_string(), entry);
        state.order.push(address.to_string());

        tracing::info!(address, "key stored");
        Ok(path)
    }

    fn delete(&self, address: &str) -> Result<(), KeystoreError> {
        let mut state = self.write_state();
        state.cache.remove(address);
        state.order.retain(|a| a != address);

        let path = self.layout.key_path(address);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            // Cache and disk converge even if the file is already gone.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KeystoreError::io(format!("delete {}", path.display()), e)),
        }
        tracing::info!(address, "key deleted");
        Ok(())
    }

    fn export(&self, address: &str) -> Result<Vec<u8>, KeystoreError> {
        let entry = self.cached(address)?;
        let bytes = std::fs::read(&entry.file_path)
            .map_err(|e| KeystoreError::io(format!("read {}", entry.file_path.display()), e))?;
        if !is_encrypted(&bytes) {
            tracing::warn!(address, "exported record is not encrypted");
        }
        Ok(bytes)
    }

    fn teardown(&self) {
        let mut state = self.write_state();
        if let Some(key) = state.master_key.take() {
            key.destroy();
        }
        state.cache.clear();
        state.order.clear();
        state.scanned = false;
        tracing::debug!("keystore torn down");
    }

    fn is_unlocked(&self) -> bool {
        self.read_state().master_key.is_some()
    }

    fn is_scanned(&self) -> bool {
        let state = self.read_state();
        state.master_key.is_some() && state.scanned
    }

    fn master_key(&self) -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>, KeystoreError> {
        let state = self.read_state();
        match &state.master_key {
            Some(buf) => master_key_bytes(buf),
            None => Err(KeystoreError::StoreLocked),
        }
    }
}
