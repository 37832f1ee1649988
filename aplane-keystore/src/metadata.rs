//! Keystore metadata: the master salt and a sealed check value.
//!
//! The check value is a fixed 12-byte sentinel sealed under the master
//! key, with the nonce prepended to the ciphertext inside the base64
//! payload. Opening it proves a candidate passphrase derives the right
//! key without storing any password hash.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use aplane_envelope::aead::{aead_open, aead_seal, fresh_nonce, NONCE_LEN};
use aplane_envelope::{derive_master_key, SecureBuffer, MASTER_KEY_LEN, SALT_LEN};

use crate::error::KeystoreError;
use crate::fsutil;

/// Well-known metadata file name under the store root.
pub const METADATA_FILE: &str = ".keystore";

/// Current metadata schema version.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Exactly 12 ASCII bytes; part of the file format.
const CHECK_SENTINEL: &[u8; 12] = b"ALGOPLANE_OK";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeystoreMetadata {
    pub version: u32,
    /// Base64 of the 32-byte master salt.
    pub salt: String,
    /// Base64 of (12-byte nonce || sealed sentinel).
    pub check: String,
    /// RFC3339 UTC creation timestamp.
    pub created: DateTime<Utc>,
}

impl KeystoreMetadata {
    /// Create fresh metadata and write it atomically under `root` with
    /// private permissions. Fails if the store is already initialized.
    pub fn create(
        root: &Path,
        passphrase: &[u8],
    ) -> Result<(Self, SecureBuffer), KeystoreError> {
        let path = metadata_path(root);
        if path.exists() {
            return Err(KeystoreError::AlreadyInitialized(path));
        }

        let (meta, master_key) = Self::create_in_memory(passphrase)?;
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| KeystoreError::Malformed(format!("serialize metadata: {}", e)))?;
        fsutil::atomic_write(&path, &json, fsutil::FILE_MODE_PRIVATE)
            .map_err(|e| KeystoreError::io(format!("write {}", path.display()), e))?;

        tracing::info!(path = %path.display(), "keystore metadata created");
        Ok((meta, master_key))
    }

    /// Same as `create` but touches no disk. The passphrase-change
    /// pipeline stages its new metadata this way.
    pub fn create_in_memory(passphrase: &[u8]) -> Result<(Self, SecureBuffer), KeystoreError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let key = derive_master_key(passphrase, &salt)?;
        let nonce = fresh_nonce()?;
        let sealed = aead_seal(&key, &nonce, CHECK_SENTINEL)?;

        let mut check = Vec::with_capacity(NONCE_LEN + sealed.len());
        check.extend_from_slice(&nonce);
        check.extend_from_slice(&sealed);

        let meta = Self {
            version: METADATA_SCHEMA_VERSION,
            salt: B64.encode(salt),
            check: B64.encode(&check),
            created: Utc::now(),
        };
        let master_key = SecureBuffer::new_from_bytes(key.as_ref());
        Ok((meta, master_key))
    }

    /// Load the metadata file, or `None` when the store is not
    /// initialized.
    pub fn load(root: &Path) -> Result<Option<Self>, KeystoreError> {
        let path = metadata_path(root);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeystoreError::io(format!("read {}", path.display()), e)),
        };

        let meta: Self = serde_json::from_slice(&bytes)
            .map_err(|e| KeystoreError::Malformed(format!("parse {}: {}", path.display(), e)))?;
        if meta.version != METADATA_SCHEMA_VERSION {
            return Err(KeystoreError::Malformed(format!(
                "unsupported metadata schema version {}",
                meta.version
            )));
        }
        Ok(Some(meta))
    }

    /// Re-derive the master key from `passphrase` and prove it against
    /// the sealed sentinel. On any failure the derived key is wiped and
    /// the caller sees `WrongPassphrase`.
    pub fn verify_and_derive(&self, passphrase: &[u8]) -> Result<SecureBuffer, KeystoreError> {
        let salt = B64
            .decode(&self.salt)
            .map_err(|_| KeystoreError::Malformed("metadata salt is not valid base64".into()))?;
        if salt.len() != SALT_LEN {
            return Err(KeystoreError::Malformed(format!(
                "metadata salt is {} bytes, expected {}",
                salt.len(),
                SALT_LEN
            )));
        }

        let key = derive_master_key(passphrase, &salt)?;
        self.verify_master_key(&key)?;
        Ok(SecureBuffer::new_from_bytes(key.as_ref()))
    }

    /// Prove that an already-derived master key opens the sealed
    /// sentinel. Fails with `WrongPassphrase` on any mismatch.
    pub fn verify_master_key(&self, key: &[u8; MASTER_KEY_LEN]) -> Result<(), KeystoreError> {
        let check = B64
            .decode(&self.check)
            .map_err(|_| KeystoreError::Malformed("metadata check is not valid base64".into()))?;
        if check.len() <= NONCE_LEN {
            return Err(KeystoreError::Malformed("metadata check too short".into()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&check[..NONCE_LEN]);

        let sentinel = aead_open(key, &nonce, &check[NONCE_LEN..])
            .map_err(|_| KeystoreError::WrongPassphrase)?;
        if sentinel.ct_eq(CHECK_SENTINEL.as_slice()).unwrap_u8() != 1 {
            return Err(KeystoreError::WrongPassphrase);
        }
        Ok(())
    }
}

pub fn metadata_path(root: &Path) -> PathBuf {
    root.join(METADATA_FILE)
}

/// Copy a held master key out of its buffer for a crypto call.
///
/// The copy wipes itself on drop; the borrow is released before any
/// blocking AEAD or KDF work runs on it.
pub fn master_key_bytes(buf: &SecureBuffer) -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>, KeystoreError> {
    buf.with_bytes(|b| {
        if b.len() != MASTER_KEY_LEN {
            return Err(KeystoreError::StoreLocked);
        }
        let mut out = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        out.copy_from_slice(b);
        Ok(out)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aplane_envelope::{open_with_master_key, seal_with_master_key};

    #[test]
    fn create_load_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (created, key) = KeystoreMetadata::create(dir.path(), b"correct-passphrase").unwrap();
        assert_eq!(created.version, 1);

        let loaded = KeystoreMetadata::load(dir.path()).unwrap().expect("metadata present");
        assert_eq!(loaded.salt, created.salt);
        assert_eq!(B64.decode(&loaded.salt).unwrap().len(), 32);
        assert!(!loaded.check.is_empty());

        let verified = loaded.verify_and_derive(b"correct-passphrase").unwrap();
        assert_eq!(verified.len(), MASTER_KEY_LEN);

        // The two derivations agree, and the key opens a fresh seal.
        let k1 = master_key_bytes(&key).unwrap();
        let k2 = master_key_bytes(&verified).unwrap();
        assert_eq!(k1[..], k2[..]);

        let sealed = seal_with_master_key(b"payload", &k1).unwrap();
        assert_eq!(&open_with_master_key(&sealed, &k2).unwrap()[..], b"payload");
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        KeystoreMetadata::create(dir.path(), b"correct-passphrase").unwrap();
        let loaded = KeystoreMetadata::load(dir.path()).unwrap().unwrap();
        assert!(matches!(
            loaded.verify_and_derive(b"wrong"),
            Err(KeystoreError::WrongPassphrase)
        ));
    }

    #[test]
    fn create_refuses_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        KeystoreMetadata::create(dir.path(), b"p").unwrap();
        assert!(matches!(
            KeystoreMetadata::create(dir.path(), b"p"),
            Err(KeystoreError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn load_absent_store_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(KeystoreMetadata::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn in_memory_metadata_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (_meta, _key) = KeystoreMetadata::create_in_memory(b"p").unwrap();
        assert!(!metadata_path(dir.path()).exists());
    }

    #[cfg(unix)]
    #[test]
    fn metadata_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        KeystoreMetadata::create(dir.path(), b"p").unwrap();
        let mode = std::fs::metadata(metadata_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
