//! Backup pipeline: portable export, restore, and audit of key
//! records.
//!
//! An exported file is a V2 (standalone) envelope around a
//! `BackupBundle`, so it can be opened anywhere with the export
//! passphrase alone. Restore re-seals the record as V1 under the
//! destination store's master key and refuses any bundle whose derived
//! address disagrees with the file name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use aplane_envelope::{
    is_encrypted, open_with_master_key, open_with_passphrase, peek_version, seal_with_master_key,
    seal_with_passphrase, ENVELOPE_V1_MASTER_KEY, ENVELOPE_V2_STANDALONE,
};

use crate::address::address_from_lsig_bytecode;
use crate::error::KeystoreError;
use crate::fsutil;
use crate::registry::Registry;
use crate::store::KeyStore;
use crate::templates::TemplateStore;
use crate::types::{
    BackupBundle, KeyRecord, StoreLayout, TemplateKind, BACKUP_FILE_EXT, BACKUP_SUBDIR,
};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What `export_one` produced: a digest of the written file and its size.
#[derive(Clone, Debug)]
pub struct BackupReceipt {
    pub address: String,
    /// Hex SHA-256 over the bytes written to the .apb file.
    pub checksum: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { key_type: String },
    /// Key already present and the operator declined to overwrite.
    SkippedExisting,
}

/// One row of a verify or deep-verify run.
#[derive(Clone, Debug)]
pub struct VerifyEntry {
    pub file: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub envelope_version: Option<u32>,
    pub ok: bool,
    pub note: String,
}

#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub entries: Vec<VerifyEntry>,
}

impl VerifyReport {
    pub fn all_ok(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|e| e.ok)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct BackupPipeline {
    store: Arc<dyn KeyStore>,
    templates: Arc<TemplateStore>,
    registry: Arc<Registry>,
    layout: StoreLayout,
}

impl BackupPipeline {
    pub fn new(
        store: Arc<dyn KeyStore>,
        templates: Arc<TemplateStore>,
        registry: Arc<Registry>,
        layout: StoreLayout,
    ) -> Self {
        Self {
            store,
            templates,
            registry,
            layout,
        }
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    /// Export one key (plus its type's template, when one exists) to
    /// `dest/apb/<address>.apb`.
    pub fn export_one(
        &self,
        address: &str,
        master_key: &[u8; 32],
        export_passphrase: &[u8],
        dest: &Path,
    ) -> Result<BackupReceipt, KeystoreError> {
        self.export_inner(address, master_key, export_passphrase, dest)
            .map_err(|e| KeystoreError::export(address, e))
    }

    fn export_inner(
        &self,
        address: &str,
        master_key: &[u8; 32],
        export_passphrase: &[u8],
        dest: &Path,
    ) -> Result<BackupReceipt, KeystoreError> {
        let encrypted = self.store.export(address)?;
        let plaintext = open_with_master_key(&encrypted, master_key)?;
        let record = KeyRecord::from_slice(&plaintext)
            .map_err(|e| KeystoreError::Malformed(format!("key record: {}", e)))?;

        // The dsa_lsig template is the more specific artifact for a
        // signing key's type; fall back to the generic kind.
        let mut template = None;
        for kind in [TemplateKind::DsaLsig, TemplateKind::Generic] {
            if let Some(definition) = self.templates.load(&record.key_type, kind, master_key)? {
                let text = String::from_utf8(definition.to_vec()).map_err(|_| {
                    KeystoreError::Malformed(format!(
                        "{} template is not valid UTF-8",
                        record.key_type
                    ))
                })?;
                template = Some((kind, text));
                break;
            }
        }

        let bundle = match template {
            Some((kind, text)) => BackupBundle::KeyWithTemplate {
                key: record,
                kind,
                template: text,
            },
            None => BackupBundle::KeyOnly { key: record },
        };
        let bundle_bytes = Zeroizing::new(
            serde_json::to_vec(&bundle)
                .map_err(|e| KeystoreError::Malformed(format!("serialize bundle: {}", e)))?,
        );

        let sealed = seal_with_passphrase(&bundle_bytes, export_passphrase)?;

        let path = backup_path(dest, address);
        fsutil::atomic_write(&path, &sealed, fsutil::FILE_MODE_PRIVATE)
            .map_err(|e| KeystoreError::io(format!("write {}", path.display()), e))?;

        tracing::info!(address, file = %path.display(), "key exported");
        Ok(BackupReceipt {
            address: address.to_string(),
            checksum: sha256_hex(&sealed),
            size: sealed.len() as u64,
        })
    }

    /// Export every key in the store.
    pub fn export_all(
        &self,
        master_key: &[u8; 32],
        export_passphrase: &[u8],
        dest: &Path,
    ) -> Result<Vec<BackupReceipt>, KeystoreError> {
        let mut receipts = Vec::new();
        for meta in self.store.list()? {
            receipts.push(self.export_one(&meta.address, master_key, export_passphrase, dest)?);
        }
        Ok(receipts)
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Restore one backup file into the store.
    ///
    /// `confirm_overwrite` is consulted before replacing an existing
    /// key; returning false skips the file.
    pub fn restore_one(
        &self,
        apb_path: &Path,
        master_key: &[u8; 32],
        export_passphrase: &[u8],
        confirm_overwrite: &dyn Fn(&str) -> bool,
    ) -> Result<RestoreOutcome, KeystoreError> {
        self.restore_inner(apb_path, master_key, export_passphrase, confirm_overwrite)
            .map_err(|e| KeystoreError::restore(apb_path.display().to_string(), e))
    }

    fn restore_inner(
        &self,
        apb_path: &Path,
        master_key: &[u8; 32],
        export_passphrase: &[u8],
        confirm_overwrite: &dyn Fn(&str) -> bool,
    ) -> Result<RestoreOutcome, KeystoreError> {
        let bytes = std::fs::read(apb_path)
            .map_err(|e| KeystoreError::io(format!("read {}", apb_path.display()), e))?;

        let bundle_bytes: Zeroizing<Vec<u8>> = if is_encrypted(&bytes) {
            match peek_version(&bytes) {
                Some(ENVELOPE_V2_STANDALONE) => open_with_passphrase(&bytes, export_passphrase)?,
                Some(ENVELOPE_V1_MASTER_KEY) => {
                    return Err(KeystoreError::LegacyBackup(apb_path.to_path_buf()))
                }
                Some(v) => return Err(KeystoreError::UnsupportedEnvelope(v)),
                None => return Err(KeystoreError::Malformed("unreadable envelope".into())),
            }
        } else {
            // Legacy unencrypted bundle: the bytes are the plaintext.
            Zeroizing::new(bytes)
        };

        let bundle: BackupBundle = serde_json::from_slice(&bundle_bytes)
            .map_err(|e| KeystoreError::Malformed(format!("backup bundle: {}", e)))?;
        let record = bundle.key();

        let derived = self.derive_record_address(record)?;
        let stem = apb_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if derived != stem {
            return Err(KeystoreError::AddressMismatch {
                file: stem.to_string(),
                derived,
            });
        }

        let target = self.layout.key_path(&derived);
        if target.exists() && !confirm_overwrite(&derived) {
            tracing::info!(address = %derived, "restore skipped: key exists");
            return Ok(RestoreOutcome::SkippedExisting);
        }

        let plaintext = Zeroizing::new(
            serde_json::to_vec(record)
                .map_err(|e| KeystoreError::Malformed(format!("serialize record: {}", e)))?,
        );
        let sealed = seal_with_master_key(&plaintext, master_key)?;
        fsutil::atomic_write(&target, &sealed, fsutil::FILE_MODE_GROUP)
            .map_err(|e| KeystoreError::io(format!("write {}", target.display()), e))?;

        if let Some((kind, definition)) = bundle.template() {
            if self.templates.exists(&record.key_type, kind) {
                tracing::debug!(key_type = %record.key_type, "bundle template already present");
            } else {
                self.templates
                    .save(definition.as_bytes(), &record.key_type, kind, master_key)?;
            }
        }

        tracing::info!(address = %derived, key_type = %record.key_type, "key restored");
        Ok(RestoreOutcome::Restored {
            key_type: record.key_type.clone(),
        })
    }

    /// Restore every `.apb` file under `src/apb` (or `src` itself).
    pub fn restore_all(
        &self,
        src: &Path,
        master_key: &[u8; 32],
        export_passphrase: &[u8],
        confirm_overwrite: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<(PathBuf, RestoreOutcome)>, KeystoreError> {
        let mut outcomes = Vec::new();
        for path in backup_files(src)? {
            let outcome =
                self.restore_one(&path, master_key, export_passphrase, confirm_overwrite)?;
            outcomes.push((path, outcome));
        }
        Ok(outcomes)
    }

    fn derive_record_address(&self, record: &KeyRecord) -> Result<String, KeystoreError> {
        if let Some(bytecode_hex) = record.lsig_bytecode.as_deref() {
            let bytecode = hex::decode(bytecode_hex)
                .map_err(|_| KeystoreError::Malformed("lsig bytecode is not valid hex".into()))?;
            return Ok(address_from_lsig_bytecode(&bytecode));
        }
        let deriver = self
            .registry
            .deriver(&record.key_type)
            .ok_or_else(|| KeystoreError::NoProvider(record.key_type.clone()))?;
        deriver.derive_address(&record.public_key, record.parameters.as_ref())
    }

    // -----------------------------------------------------------------------
    // Verify
    // -----------------------------------------------------------------------

    /// Structural audit: every `.apb` file parses as an envelope.
    pub fn verify(&self, backup_path: &Path) -> Result<VerifyReport, KeystoreError> {
        let mut report = VerifyReport::default();
        for path in backup_files(backup_path)? {
            let bytes = std::fs::read(&path)
                .map_err(|e| KeystoreError::io(format!("read {}", path.display()), e))?;
            let version = peek_version(&bytes);
            let (ok, note) = match version {
                Some(ENVELOPE_V2_STANDALONE) => (true, "standalone envelope".to_string()),
                Some(ENVELOPE_V1_MASTER_KEY) => {
                    (false, "legacy v1 backup, re-export under current format".to_string())
                }
                Some(v) => (false, format!("unsupported envelope version {}", v)),
                None => (false, "not an envelope".to_string()),
            };
            report.entries.push(VerifyEntry {
                size: bytes.len() as u64,
                checksum: sha256_hex(&bytes),
                envelope_version: version,
                ok,
                note,
                file: path,
            });
        }
        Ok(report)
    }

    /// Deep audit: additionally open each envelope, parse the bundle,
    /// and re-derive the address against the file name.
    pub fn deep_verify(
        &self,
        backup_path: &Path,
        export_passphrase: &[u8],
    ) -> Result<VerifyReport, KeystoreError> {
        let mut report = self.verify(backup_path)?;
        for entry in &mut report.entries {
            if !entry.ok {
                continue;
            }
            let bytes = std::fs::read(&entry.file)
                .map_err(|e| KeystoreError::io(format!("read {}", entry.file.display()), e))?;
            match self.deep_check(&entry.file, &bytes, export_passphrase) {
                Ok(key_type) => entry.note = format!("verified ({})", key_type),
                Err(e) => {
                    entry.ok = false;
                    entry.note = e.to_string();
                }
            }
        }
        Ok(report)
    }

    fn deep_check(
        &self,
        path: &Path,
        bytes: &[u8],
        export_passphrase: &[u8],
    ) -> Result<String, KeystoreError> {
        let bundle_bytes = open_with_passphrase(bytes, export_passphrase)?;
        let bundle: BackupBundle = serde_json::from_slice(&bundle_bytes)
            .map_err(|e| KeystoreError::Malformed(format!("backup bundle: {}", e)))?;
        let record = bundle.key();

        let derived = self.derive_record_address(record)?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if derived != stem {
            return Err(KeystoreError::AddressMismatch {
                file: stem.to_string(),
                derived,
            });
        }
        Ok(record.key_type.clone())
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn backup_path(dest: &Path, address: &str) -> PathBuf {
    dest.join(BACKUP_SUBDIR)
        .join(format!("{}.{}", address, BACKUP_FILE_EXT))
}

/// The `.apb` files under `path/apb`, or `path` itself when it has no
/// `apb` subdirectory. Sorted for stable iteration.
fn backup_files(path: &Path) -> Result<Vec<PathBuf>, KeystoreError> {
    let dir = {
        let sub = path.join(BACKUP_SUBDIR);
        if sub.is_dir() {
            sub
        } else {
            path.to_path_buf()
        }
    };
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| KeystoreError::io(format!("list {}", dir.display()), e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KeystoreError::io(format!("list {}", dir.display()), e))?;
        let p = entry.path();
        if p.extension().and_then(|e| e.to_str()) == Some(BACKUP_FILE_EXT) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
