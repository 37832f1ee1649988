//! Error types for the keystore.

use std::fmt;
use std::io;
use std::path::PathBuf;

use aplane_envelope::EnvelopeError;

use crate::types::TemplateKind;

// ---------------------------------------------------------------------------
// Top-level keystore error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum KeystoreError {
    /// Metadata file absent where one is required.
    NotInitialized,
    /// Init attempted on a store that already has metadata.
    AlreadyInitialized(PathBuf),
    /// Sentinel or AEAD mismatch while verifying a candidate passphrase.
    WrongPassphrase,
    /// AEAD failure during a routine open with a supposedly-correct master key.
    WrongKey,
    /// Envelope version does not match the opener.
    WrongVersion(String),
    /// Restore refuses V1 backups outright.
    LegacyBackup(PathBuf),
    /// Envelope version unknown to this build.
    UnsupportedEnvelope(u32),
    KeyNotFound(String),
    KeyExists(String),
    /// Restore-time consistency failure: bundle contents vs. filename.
    AddressMismatch { file: String, derived: String },
    /// Operation requires a master key that has not been initialized.
    StoreLocked,
    /// Operation requires a completed scan.
    NotScanned,
    /// The passphrase helper refused the new passphrase.
    HelperWriteFailed(String),
    HelperReadFailed(String),
    NoProvider(String),
    TemplateExists { key_type: String, kind: TemplateKind },
    /// Template key_type collides with a built-in provider family.
    BuiltinKeyType(String),
    /// A record, bundle, or metadata file failed to parse.
    Malformed(String),
    EmptyPassphrase,
    PassphraseUnchanged,
    Io { context: String, source: io::Error },
    /// Export failure, tagged with the affected address.
    Export { address: String, source: Box<KeystoreError> },
    /// Restore failure, tagged with the affected file.
    Restore { file: String, source: Box<KeystoreError> },
    /// Passphrase-change failure, tagged with the affected file.
    ChangePass { file: String, source: Box<KeystoreError> },
}

impl KeystoreError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    pub fn export(address: impl Into<String>, source: KeystoreError) -> Self {
        Self::Export { address: address.into(), source: Box::new(source) }
    }

    pub fn restore(file: impl Into<String>, source: KeystoreError) -> Self {
        Self::Restore { file: file.into(), source: Box::new(source) }
    }

    pub fn changepass(file: impl Into<String>, source: KeystoreError) -> Self {
        Self::ChangePass { file: file.into(), source: Box::new(source) }
    }
}

impl fmt::Display for KeystoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "keystore not initialized"),
            Self::AlreadyInitialized(p) => {
                write!(f, "keystore already initialized at {}", p.display())
            }
            Self::WrongPassphrase => write!(f, "wrong passphrase"),
            Self::WrongKey => write!(f, "decryption failed: wrong master key or corrupt record"),
            Self::WrongVersion(msg) => write!(f, "{}", msg),
            Self::LegacyBackup(p) => write!(
                f,
                "{}: legacy v1 backup, re-export under current format",
                p.display()
            ),
            Self::UnsupportedEnvelope(v) => write!(f, "unsupported envelope version {}", v),
            Self::KeyNotFound(addr) => write!(f, "key not found: {}", addr),
            Self::KeyExists(addr) => write!(f, "key already exists: {}", addr),
            Self::AddressMismatch { file, derived } => write!(
                f,
                "address mismatch: file is named {} but contents derive {}",
                file, derived
            ),
            Self::StoreLocked => write!(f, "keystore is locked: master key not initialized"),
            Self::NotScanned => write!(f, "keystore not scanned"),
            Self::HelperWriteFailed(msg) => write!(f, "passphrase helper write failed: {}", msg),
            Self::HelperReadFailed(msg) => write!(f, "passphrase helper read failed: {}", msg),
            Self::NoProvider(kt) => write!(f, "no signing provider registered for {}", kt),
            Self::TemplateExists { key_type, kind } => {
                write!(f, "template already exists for {} ({})", key_type, kind)
            }
            Self::BuiltinKeyType(kt) => {
                write!(f, "{} is a built-in key type and cannot take a template", kt)
            }
            Self::Malformed(msg) => write!(f, "{}", msg),
            Self::EmptyPassphrase => write!(f, "new passphrase is empty"),
            Self::PassphraseUnchanged => write!(f, "new passphrase equals the old one"),
            Self::Io { context, source } => write!(f, "{}: {}", context, source),
            Self::Export { address, source } => write!(f, "export {}: {}", address, source),
            Self::Restore { file, source } => write!(f, "restore {}: {}", file, source),
            Self::ChangePass { file, source } => write!(f, "passphrase change {}: {}", file, source),
        }
    }
}

impl std::error::Error for KeystoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Export { source, .. }
            | Self::Restore { source, .. }
            | Self::ChangePass { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<EnvelopeError> for KeystoreError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::WrongKey => Self::WrongKey,
            EnvelopeError::WrongPassphrase => Self::WrongPassphrase,
            EnvelopeError::WrongVersion { .. } => Self::WrongVersion(e.to_string()),
            EnvelopeError::UnsupportedVersion(v) => Self::UnsupportedEnvelope(v),
            EnvelopeError::Malformed(msg) => Self::Malformed(msg),
            EnvelopeError::Crypto(what) => Self::Malformed(format!("crypto failure: {}", what)),
        }
    }
}
