//! Signer session: the in-memory holder of the passphrase cache for
//! the lifetime of an unlocked signer.
//!
//! The master key itself lives inside the KeyStore backend; the
//! session caches the passphrase so the operator is prompted at most
//! once, and serializes prompting so parallel requests cannot race two
//! prompts onto one terminal.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aplane_envelope::SecureBuffer;

use crate::error::KeystoreError;
use crate::store::KeyStore;
use crate::provider::KeyMaterial;

/// How long `destroy` waits for in-flight requests before giving up.
const DESTROY_WAIT: Duration = Duration::from_secs(2);
const DESTROY_POLL: Duration = Duration::from_millis(25);

pub struct Session {
    store: Arc<dyn KeyStore>,
    passphrase: Mutex<Option<SecureBuffer>>,
}

impl Session {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            passphrase: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Cache `passphrase`, destroying any previously cached value.
    /// Does not itself decrypt anything.
    pub fn initialize_session(&self, passphrase: &[u8]) {
        let mut guard = self.passphrase.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = guard.take() {
            old.destroy();
        }
        *guard = Some(SecureBuffer::new_from_bytes(passphrase));
    }

    /// Retrieve signing material for `address`, prompting for the
    /// passphrase via `prompt_fn` if none is cached.
    ///
    /// The lock is held for the whole call so at most one prompt is in
    /// flight; concurrent cache reads inside the KeyStore are guarded
    /// by its own reader/writer lock.
    pub fn get_key(
        &self,
        address: &str,
        prompt_fn: &dyn Fn() -> Result<SecureBuffer, KeystoreError>,
    ) -> Result<KeyMaterial, KeystoreError> {
        let mut guard = self.passphrase.lock().unwrap_or_else(|e| e.into_inner());

        if guard.is_none() {
            *guard = Some(prompt_fn()?);
        }
        if guard.as_ref().map(|b| b.is_empty()).unwrap_or(true) {
            if let Some(empty) = guard.take() {
                empty.destroy();
            }
            return Err(KeystoreError::EmptyPassphrase);
        }

        if !self.store.is_scanned() {
            let result = guard
                .as_ref()
                .map(|buf| buf.with_bytes(|b| self.store.initialize_master_key(b)))
                .unwrap_or(Err(KeystoreError::StoreLocked));
            if let Err(e) = result {
                // A bad cached passphrase must not poison later attempts.
                if let Some(bad) = guard.take() {
                    bad.destroy();
                }
                return Err(e);
            }
            self.store.scan()?;
        }

        self.store.get(address)
    }

    /// Wipe the cached passphrase, waiting up to two seconds for any
    /// in-flight request. On timeout the wipe is skipped: a
    /// long-running signature may finish, and process exit completes
    /// the teardown.
    pub fn destroy(&self) {
        let deadline = Instant::now() + DESTROY_WAIT;
        loop {
            if let Ok(mut guard) = self.passphrase.try_lock() {
                if let Some(buf) = guard.take() {
                    buf.destroy();
                }
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!("session destroy timed out waiting for in-flight request");
                return;
            }
            std::thread::sleep(DESTROY_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::metadata::KeystoreMetadata;
    use crate::registry::default_registry;
    use crate::store::FileKeyStore;
    use crate::types::{KeyRecord, StoreLayout};
    use ed25519_dalek::SigningKey;

    fn seeded_store(passphrase: &[u8]) -> (tempfile::TempDir, Arc<FileKeyStore>, String) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "default");
        KeystoreMetadata::create(dir.path(), passphrase).unwrap();

        let store = Arc::new(FileKeyStore::new(layout, Arc::new(default_registry())));
        store.initialize_master_key(passphrase).unwrap();
        store.scan().unwrap();

        let signing_key = SigningKey::from_bytes(&[11u8; 32]);
        let record = KeyRecord {
            key_type: "ed25519".into(),
            public_key: hex::encode(signing_key.verifying_key().to_bytes()),
            private_key: Some(hex::encode(signing_key.to_bytes())),
            lsig_bytecode: None,
            parameters: None,
            created_at: None,
        };
        let address =
            crate::address::address_from_public_key(&signing_key.verifying_key().to_bytes());
        store
            .store(&address, &serde_json::to_vec(&record).unwrap())
            .unwrap();
        store.teardown();

        (dir, store, address)
    }

    #[test]
    fn get_key_prompts_once_and_caches() {
        let (_dir, store, address) = seeded_store(b"pass");
        let session = Session::new(store);

        let prompts = AtomicUsize::new(0);
        let prompt = || {
            prompts.fetch_add(1, Ordering::SeqCst);
            Ok(SecureBuffer::new_from_bytes(b"pass"))
        };

        session.get_key(&address, &prompt).unwrap();
        session.get_key(&address, &prompt).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn initialized_session_never_prompts() {
        let (_dir, store, address) = seeded_store(b"pass");
        let session = Session::new(store);
        session.initialize_session(b"pass");

        let prompt = || -> Result<SecureBuffer, KeystoreError> {
            panic!("prompt must not be called");
        };
        session.get_key(&address, &prompt).unwrap();
    }

    #[test]
    fn wrong_cached_passphrase_is_dropped() {
        let (_dir, store, address) = seeded_store(b"pass");
        let session = Session::new(store);
        session.initialize_session(b"wrong");

        let prompt = || Ok(SecureBuffer::new_from_bytes(b"pass"));
        assert!(matches!(
            session.get_key(&address, &prompt),
            Err(KeystoreError::WrongPassphrase)
        ));
        // The bad value was discarded; the next call prompts and succeeds.
        session.get_key(&address, &prompt).unwrap();
    }

    #[test]
    fn destroy_wipes_cached_passphrase() {
        let (_dir, store, _address) = seeded_store(b"pass");
        let session = Session::new(store);
        session.initialize_session(b"pass");
        session.destroy();

        let guard = session.passphrase.lock().unwrap();
        assert!(guard.is_none());
    }
}
