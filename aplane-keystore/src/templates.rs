//! Template store: versioned LogicSig template definitions, one
//! encrypted record per (key_type, kind).

use std::path::PathBuf;
use std::sync::Arc;

use zeroize::Zeroizing;

use aplane_envelope::{open_with_master_key, seal_with_master_key};

use crate::error::KeystoreError;
use crate::fsutil;
use crate::registry::Registry;
use crate::types::{StoreLayout, TemplateInfo, TemplateKind, TEMPLATE_FILE_EXT};

pub struct TemplateStore {
    layout: StoreLayout,
    registry: Arc<Registry>,
}

impl TemplateStore {
    pub fn new(layout: StoreLayout, registry: Arc<Registry>) -> Self {
        Self { layout, registry }
    }

    /// Encrypt and persist a template definition.
    ///
    /// Refuses a (key_type, kind) that already has a template, and any
    /// key_type claimed by a built-in signing provider.
    pub fn save(
        &self,
        definition: &[u8],
        key_type: &str,
        kind: TemplateKind,
        master_key: &[u8; 32],
    ) -> Result<PathBuf, KeystoreError> {
        if self.registry.has_provider(key_type) {
            return Err(KeystoreError::BuiltinKeyType(key_type.to_string()));
        }
        if self.exists(key_type, kind) {
            return Err(KeystoreError::TemplateExists {
                key_type: key_type.to_string(),
                kind,
            });
        }

        let sealed = seal_with_master_key(definition, master_key)?;
        let path = self.layout.template_path(key_type, kind);
        fsutil::atomic_write(&path, &sealed, fsutil::FILE_MODE_GROUP)
            .map_err(|e| KeystoreError::io(format!("write {}", path.display()), e))?;

        tracing::info!(key_type, kind = %kind, "template saved");
        Ok(path)
    }

    pub fn exists(&self, key_type: &str, kind: TemplateKind) -> bool {
        self.layout.template_path(key_type, kind).exists()
    }

    /// Decrypt one template, or `None` when absent.
    pub fn load(
        &self,
        key_type: &str,
        kind: TemplateKind,
        master_key: &[u8; 32],
    ) -> Result<Option<Zeroizing<Vec<u8>>>, KeystoreError> {
        let path = self.layout.template_path(key_type, kind);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeystoreError::io(format!("read {}", path.display()), e)),
        };
        Ok(Some(open_with_master_key(&bytes, master_key)?))
    }

    /// All stored templates: (key_type, kind, encrypted size on disk).
    pub fn list(&self) -> Result<Vec<TemplateInfo>, KeystoreError> {
        let mut out = Vec::new();
        for kind in TemplateKind::all() {
            let dir = self.layout.templates_dir(kind);
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(KeystoreError::io(format!("list {}", dir.display()), e)),
            };
            for entry in entries {
                let entry =
                    entry.map_err(|e| KeystoreError::io(format!("list {}", dir.display()), e))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_FILE_EXT) {
                    continue;
                }
                let Some(key_type) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                out.push(TemplateInfo {
                    key_type: key_type.to_string(),
                    kind,
                    size_bytes,
                });
            }
        }
        out.sort_by(|a, b| (a.key_type.as_str(), a.kind.dir_name())
            .cmp(&(b.key_type.as_str(), b.kind.dir_name())));
        Ok(out)
    }

    /// Paths of every template file, sorted; used by the passphrase
    /// change pipeline to enumerate encrypted artifacts.
    pub fn paths(&self) -> Result<Vec<PathBuf>, KeystoreError> {
        let mut out = Vec::new();
        for kind in TemplateKind::all() {
            let dir = self.layout.templates_dir(kind);
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(KeystoreError::io(format!("list {}", dir.display()), e)),
            };
            for entry in entries {
                let entry =
                    entry.map_err(|e| KeystoreError::io(format!("list {}", dir.display()), e))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some(TEMPLATE_FILE_EXT) {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
