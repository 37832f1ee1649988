//! Shared fixtures for the integration suites.

use std::sync::Arc;

use ed25519_dalek::SigningKey;

use aplane_keystore::address::{address_from_lsig_bytecode, address_from_public_key};
use aplane_keystore::{
    default_registry, FileKeyStore, KeyRecord, KeyStore, KeystoreMetadata, Registry, StoreLayout,
    TemplateStore,
};

pub const MASTER_PASS: &[u8] = b"correct-passphrase";

/// The default registry plus a generic-LogicSig family used by tests.
pub fn test_registry() -> Arc<Registry> {
    let mut registry = default_registry();
    registry.register_generic_lsig("tealish");
    Arc::new(registry)
}

pub struct Env {
    pub dir: tempfile::TempDir,
    pub layout: StoreLayout,
    pub registry: Arc<Registry>,
    pub store: Arc<FileKeyStore>,
    pub templates: Arc<TemplateStore>,
}

/// A fresh initialized store, unlocked and scanned.
pub fn unlocked_env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(dir.path(), "default");
    KeystoreMetadata::create(layout.root(), MASTER_PASS).unwrap();

    let registry = test_registry();
    let store = Arc::new(FileKeyStore::new(layout.clone(), registry.clone()));
    store.initialize_master_key(MASTER_PASS).unwrap();
    store.scan().unwrap();

    let templates = Arc::new(TemplateStore::new(layout.clone(), registry.clone()));
    Env {
        dir,
        layout,
        registry,
        store,
        templates,
    }
}

/// A deterministic ed25519 key record: (address, record, serialized).
pub fn ed25519_record(seed: u8) -> (String, KeyRecord, Vec<u8>) {
    let signing_key = SigningKey::from_bytes(&[seed; 32]);
    let public = signing_key.verifying_key().to_bytes();
    let record = KeyRecord {
        key_type: "ed25519".into(),
        public_key: hex::encode(public),
        private_key: Some(hex::encode(signing_key.to_bytes())),
        lsig_bytecode: None,
        parameters: None,
        created_at: None,
    };
    let bytes = serde_json::to_vec(&record).unwrap();
    (address_from_public_key(&public), record, bytes)
}

/// A bytecode-only LogicSig record of the test "tealish" family.
pub fn lsig_record(bytecode: &[u8]) -> (String, KeyRecord, Vec<u8>) {
    let record = KeyRecord {
        key_type: "tealish".into(),
        public_key: String::new(),
        private_key: None,
        lsig_bytecode: Some(hex::encode(bytecode)),
        parameters: None,
        created_at: None,
    };
    let bytes = serde_json::to_vec(&record).unwrap();
    (address_from_lsig_bytecode(bytecode), record, bytes)
}
