//! # aplane-keystore
//!
//! The encrypted key and template store behind the aplane signing
//! suite: passphrase-derived master-key lifecycle, on-demand record
//! decryption, portable backups, and crash-safe passphrase changes.
//!
//! Built on `aplane-envelope` for the sealing primitives. The store is
//! a blocking library: callers run it from worker threads, and shared
//! state is guarded by `std::sync` reader/writer locks.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use aplane_keystore::{
//!     default_registry, FileKeyStore, KeystoreMetadata, Session, StoreLayout,
//! };
//!
//! let layout = StoreLayout::new("/var/lib/aplane/keystore", "default");
//! KeystoreMetadata::create(layout.root(), b"correct-passphrase").unwrap();
//!
//! let registry = Arc::new(default_registry());
//! let store = Arc::new(FileKeyStore::new(layout, registry));
//! let session = Session::new(store);
//! session.initialize_session(b"correct-passphrase");
//! ```

pub mod address;
pub mod backup;
pub mod changepass;
pub mod error;
pub mod fsutil;
pub mod helper;
pub mod metadata;
pub mod provider;
pub mod registry;
pub mod session;
pub mod store;
pub mod templates;
pub mod types;

// Re-export main types for convenience
pub use backup::{BackupPipeline, BackupReceipt, RestoreOutcome, VerifyEntry, VerifyReport};
pub use changepass::{recover, ChangeReport, PassphraseChange, RecoveryOutcome};
pub use error::KeystoreError;
pub use helper::PassphraseHelper;
pub use metadata::{KeystoreMetadata, METADATA_FILE};
pub use provider::{
    AddressDeriver, KeyMaterial, KeyMaterialValue, SigningProvider, ED25519_FAMILY,
};
pub use registry::{default_registry, Registry};
pub use session::Session;
pub use store::{FileKeyStore, KeyStore};
pub use templates::TemplateStore;
pub use types::{
    BackupBundle, KeyMetadata, KeyRecord, PublicKeyInfo, StoreLayout, TemplateInfo, TemplateKind,
};
