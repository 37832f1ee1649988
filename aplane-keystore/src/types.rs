//! Core types: key records, listing metadata, template kinds, backup
//! bundles, and the on-disk layout.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extension of an individual encrypted key record.
pub const KEY_FILE_EXT: &str = "key";
/// Extension of an encrypted template record.
pub const TEMPLATE_FILE_EXT: &str = "template";
/// Extension of a portable backup bundle.
pub const BACKUP_FILE_EXT: &str = "apb";
/// Subdirectory of a backup destination holding the bundles.
pub const BACKUP_SUBDIR: &str = "apb";
/// Name of the bearer-token file alongside a user's keys.
pub const TOKEN_FILE: &str = "aplane.token";

/// Key type recorded for entries stored before their plaintext was parsed.
pub const KEY_TYPE_UNKNOWN: &str = "unknown";

// ---------------------------------------------------------------------------
// Key records (the plaintext inside a V1 envelope)
// ---------------------------------------------------------------------------

/// Decrypted contents of a stored key file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_type: String,
    /// Hex-encoded public key.
    pub public_key: String,
    /// Hex-encoded private key. Absent for bytecode-only records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Hex-encoded LogicSig bytecode, when the key is program-backed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsig_bytecode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decoded bytecode length in bytes; 0 when there is none.
    pub fn lsig_size(&self) -> usize {
        self.lsig_bytecode
            .as_deref()
            .map(|h| h.len() / 2)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Listing metadata (public, never includes secrets)
// ---------------------------------------------------------------------------

/// Non-sensitive information about one stored key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub address: String,
    pub key_type: String,
    pub created_at: DateTime<Utc>,
    pub storage_type: String,
    pub exportable: bool,
    pub file_path: PathBuf,
}

/// Cached public material for the signer's key-listing endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub address: String,
    pub key_type: String,
    pub public_key_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsig_bytecode_hex: Option<String>,
    pub lsig_size: usize,
}

// ---------------------------------------------------------------------------
// Template kinds
// ---------------------------------------------------------------------------

/// Which template family a definition belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Generic,
    DsaLsig,
}

impl TemplateKind {
    /// Directory name under `templates/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            TemplateKind::Generic => "generic",
            TemplateKind::DsaLsig => "dsa_lsig",
        }
    }

    pub fn all() -> [TemplateKind; 2] {
        [TemplateKind::Generic, TemplateKind::DsaLsig]
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Summary row for template listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub key_type: String,
    pub kind: TemplateKind,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Backup bundles (the plaintext inside a V2 envelope)
// ---------------------------------------------------------------------------

/// Contents of a portable backup file: a key record, optionally
/// accompanied by the template its key type depends on.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "bundle", rename_all = "snake_case")]
pub enum BackupBundle {
    KeyOnly {
        key: KeyRecord,
    },
    KeyWithTemplate {
        key: KeyRecord,
        kind: TemplateKind,
        template: String,
    },
}

impl BackupBundle {
    pub fn key(&self) -> &KeyRecord {
        match self {
            BackupBundle::KeyOnly { key } => key,
            BackupBundle::KeyWithTemplate { key, .. } => key,
        }
    }

    pub fn template(&self) -> Option<(TemplateKind, &str)> {
        match self {
            BackupBundle::KeyOnly { .. } => None,
            BackupBundle::KeyWithTemplate { kind, template, .. } => Some((*kind, template)),
        }
    }
}

// ---------------------------------------------------------------------------
// Store layout
// ---------------------------------------------------------------------------

/// Resolves every path inside a store rooted at `root` for one identity.
///
/// ```text
/// root/.keystore
/// root/users/<identity>/keys/<address>.key
/// root/users/<identity>/templates/generic/<keyType>.template
/// root/users/<identity>/templates/dsa_lsig/<keyType>.template
/// root/users/<identity>/aplane.token
/// ```
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
    identity: String,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            identity: identity.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn user_dir(&self) -> PathBuf {
        self.root.join("users").join(&self.identity)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.user_dir().join("keys")
    }

    pub fn key_path(&self, address: &str) -> PathBuf {
        self.keys_dir().join(format!("{}.{}", address, KEY_FILE_EXT))
    }

    pub fn templates_dir(&self, kind: TemplateKind) -> PathBuf {
        self.user_dir().join("templates").join(kind.dir_name())
    }

    pub fn template_path(&self, key_type: &str, kind: TemplateKind) -> PathBuf {
        self.templates_dir(kind)
            .join(format!("{}.{}", key_type, TEMPLATE_FILE_EXT))
    }

    pub fn token_path(&self) -> PathBuf {
        self.user_dir().join(TOKEN_FILE)
    }
}
