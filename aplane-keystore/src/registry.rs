//! Runtime lookup of signing providers and address derivers.
//!
//! A registry is populated during process startup, wrapped in an `Arc`,
//! and read-only thereafter. Registering the same family twice is a
//! programming error and aborts startup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::provider::{
    family_of, AddressDeriver, Ed25519Deriver, Ed25519Provider, SigningProvider,
};

#[derive(Default)]
pub struct Registry {
    providers: HashMap<String, Arc<dyn SigningProvider>>,
    derivers: HashMap<String, Arc<dyn AddressDeriver>>,
    generic_lsig: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signing provider under its family name.
    ///
    /// Panics on duplicate registration: two providers claiming one
    /// family is unrecoverable misconfiguration.
    pub fn register_provider(&mut self, provider: Arc<dyn SigningProvider>) {
        let family = provider.family().to_string();
        if self.providers.insert(family.clone(), provider).is_some() {
            panic!("duplicate signing provider registered for family {}", family);
        }
    }

    /// Register an address deriver for a family. Panics on duplicates.
    pub fn register_deriver(&mut self, family: &str, deriver: Arc<dyn AddressDeriver>) {
        if self.derivers.insert(family.to_string(), deriver).is_some() {
            panic!("duplicate address deriver registered for family {}", family);
        }
    }

    /// Classify a family as generic LogicSig: bytecode-only, no signing
    /// provider. Panics on duplicates.
    pub fn register_generic_lsig(&mut self, family: &str) {
        if !self.generic_lsig.insert(family.to_string()) {
            panic!("family {} already classified as generic LogicSig", family);
        }
    }

    /// Look up a provider by versioned key type: exact match first, then
    /// the family prefix, so `falcon1024-v2` can reuse the `falcon1024`
    /// provider.
    pub fn provider(&self, key_type: &str) -> Option<Arc<dyn SigningProvider>> {
        self.providers
            .get(key_type)
            .or_else(|| self.providers.get(family_of(key_type)))
            .cloned()
    }

    pub fn deriver(&self, key_type: &str) -> Option<Arc<dyn AddressDeriver>> {
        self.derivers
            .get(key_type)
            .or_else(|| self.derivers.get(family_of(key_type)))
            .cloned()
    }

    pub fn is_generic_lsig(&self, key_type: &str) -> bool {
        self.generic_lsig.contains(key_type) || self.generic_lsig.contains(family_of(key_type))
    }

    /// Whether the key type resolves to a built-in signing provider.
    pub fn has_provider(&self, key_type: &str) -> bool {
        self.provider(key_type).is_some()
    }
}

/// The registry every aplane process starts from: the ed25519 family
/// with its account-address deriver. Further families (post-quantum
/// DSAs, composed LogicSig types) are registered by their plugins
/// before any store is opened.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_provider(Arc::new(Ed25519Provider));
    registry.register_deriver("ed25519", Arc::new(Ed25519Deriver));
    registry
}
