//! Signing providers and address derivers.
//!
//! A provider owns everything algorithm-specific: parsing decrypted key
//! records into usable material, producing signatures, and wiping the
//! material afterwards. The store only ever dispatches through these
//! traits by key-type string.

use std::collections::HashMap;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

use crate::address;
use crate::error::KeystoreError;
use crate::types::KeyRecord;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// In-memory key material produced by a provider. Secret fields wipe
/// themselves on drop.
#[derive(Debug)]
pub struct KeyMaterial {
    pub key_type: String,
    pub value: KeyMaterialValue,
    /// LogicSig bytecode carried alongside non-lsig material; empty for
    /// plain account keys.
    pub bytecode: Option<Vec<u8>>,
}

pub enum KeyMaterialValue {
    Ed25519 {
        verifying_key: [u8; 32],
        signing_key: Zeroizing<[u8; 32]>,
    },
    PostQuantum {
        public_key: Vec<u8>,
        secret_key: Zeroizing<Vec<u8>>,
        parameters: HashMap<String, String>,
    },
    GenericLsig {
        bytecode: Vec<u8>,
    },
}

// Secret fields stay out of Debug output.
impl std::fmt::Debug for KeyMaterialValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ed25519 { verifying_key, .. } => f
                .debug_struct("Ed25519")
                .field("verifying_key", &hex::encode(verifying_key))
                .finish_non_exhaustive(),
            Self::PostQuantum { public_key, parameters, .. } => f
                .debug_struct("PostQuantum")
                .field("public_key", &hex::encode(public_key))
                .field("parameters", parameters)
                .finish_non_exhaustive(),
            Self::GenericLsig { bytecode } => f
                .debug_struct("GenericLsig")
                .field("bytecode_len", &bytecode.len())
                .finish(),
        }
    }
}

impl KeyMaterial {
    /// Wipe every secret field in place.
    pub fn wipe(&mut self) {
        match &mut self.value {
            KeyMaterialValue::Ed25519 { signing_key, .. } => signing_key.zeroize(),
            KeyMaterialValue::PostQuantum { secret_key, .. } => secret_key.zeroize(),
            KeyMaterialValue::GenericLsig { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Algorithm family behind a set of key types.
pub trait SigningProvider: Send + Sync {
    /// Family name, e.g. "ed25519" or "falcon1024".
    fn family(&self) -> &str;

    /// Parse a decrypted key record into signing material.
    fn load_keys_from_data(&self, data: &[u8]) -> Result<KeyMaterial, KeystoreError>;

    fn sign(&self, material: &KeyMaterial, message: &[u8]) -> Result<Vec<u8>, KeystoreError>;

    fn zero_key(&self, material: &mut KeyMaterial) {
        material.wipe();
    }

    /// Whether `data` looks like a key record of this family.
    fn detect_key_type(&self, data: &[u8], passphrase: Option<&[u8]>) -> bool;
}

/// Derives the on-chain address for a key type's public material.
pub trait AddressDeriver: Send + Sync {
    fn derive_address(
        &self,
        public_key_hex: &str,
        parameters: Option<&HashMap<String, String>>,
    ) -> Result<String, KeystoreError>;
}

// ---------------------------------------------------------------------------
// Built-in ed25519 family
// ---------------------------------------------------------------------------

pub struct Ed25519Provider;

pub const ED25519_FAMILY: &str = "ed25519";

impl Ed25519Provider {
    fn parse_record(&self, data: &[u8]) -> Result<(KeyRecord, SigningKey), KeystoreError> {
        let record = KeyRecord::from_slice(data)
            .map_err(|e| KeystoreError::Malformed(format!("key record: {}", e)))?;
        let private_hex = record
            .private_key
            .as_deref()
            .ok_or_else(|| KeystoreError::Malformed("ed25519 record has no private key".into()))?;
        let private = Zeroizing::new(
            hex::decode(private_hex)
                .map_err(|_| KeystoreError::Malformed("private key is not valid hex".into()))?,
        );
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            private.as_slice().try_into().map_err(|_| {
                KeystoreError::Malformed("ed25519 private key is not 32 bytes".into())
            })?,
        );

        let signing_key = SigningKey::from_bytes(&seed);
        let public = hex::decode(&record.public_key)
            .map_err(|_| KeystoreError::Malformed("public key is not valid hex".into()))?;
        if public != signing_key.verifying_key().to_bytes() {
            return Err(KeystoreError::Malformed(
                "ed25519 public key does not match private key".into(),
            ));
        }
        Ok((record, signing_key))
    }
}

impl SigningProvider for Ed25519Provider {
    fn family(&self) -> &str {
        ED25519_FAMILY
    }

    fn load_keys_from_data(&self, data: &[u8]) -> Result<KeyMaterial, KeystoreError> {
        let (record, signing_key) = self.parse_record(data)?;
        let bytecode = match record.lsig_bytecode.as_deref() {
            Some(h) => Some(
                hex::decode(h)
                    .map_err(|_| KeystoreError::Malformed("lsig bytecode is not valid hex".into()))?,
            ),
            None => None,
        };
        Ok(KeyMaterial {
            key_type: record.key_type,
            value: KeyMaterialValue::Ed25519 {
                verifying_key: signing_key.verifying_key().to_bytes(),
                signing_key: Zeroizing::new(signing_key.to_bytes()),
            },
            bytecode,
        })
    }

    fn sign(&self, material: &KeyMaterial, message: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        match &material.value {
            KeyMaterialValue::Ed25519 { signing_key, .. } => {
                let key = SigningKey::from_bytes(signing_key);
                Ok(key.sign(message).to_bytes().to_vec())
            }
            _ => Err(KeystoreError::NoProvider(material.key_type.clone())),
        }
    }

    fn detect_key_type(&self, data: &[u8], _passphrase: Option<&[u8]>) -> bool {
        KeyRecord::from_slice(data)
            .map(|r| family_of(&r.key_type) == ED25519_FAMILY)
            .unwrap_or(false)
    }
}

pub struct Ed25519Deriver;

impl AddressDeriver for Ed25519Deriver {
    fn derive_address(
        &self,
        public_key_hex: &str,
        _parameters: Option<&HashMap<String, String>>,
    ) -> Result<String, KeystoreError> {
        let bytes = hex::decode(public_key_hex)
            .map_err(|_| KeystoreError::Malformed("public key is not valid hex".into()))?;
        let pk: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::Malformed("ed25519 public key is not 32 bytes".into()))?;
        // Round-trip through the dalek type to reject non-canonical points early.
        VerifyingKey::from_bytes(&pk)
            .map_err(|_| KeystoreError::Malformed("invalid ed25519 public key".into()))?;
        Ok(address::address_from_public_key(&pk))
    }
}

/// Family prefix of a versioned key type: `falcon1024-v1` → `falcon1024`.
/// A type with no `-v<digits>` suffix is its own family.
pub fn family_of(key_type: &str) -> &str {
    if let Some(idx) = key_type.rfind("-v") {
        if key_type[idx + 2..].chars().all(|c| c.is_ascii_digit())
            && !key_type[idx + 2..].is_empty()
        {
            return &key_type[..idx];
        }
    }
    key_type
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(seed: u8) -> (String, Vec<u8>) {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let record = KeyRecord {
            key_type: "ed25519".into(),
            public_key: hex::encode(signing_key.verifying_key().to_bytes()),
            private_key: Some(hex::encode(signing_key.to_bytes())),
            lsig_bytecode: None,
            parameters: None,
            created_at: None,
        };
        let addr = address::address_from_public_key(&signing_key.verifying_key().to_bytes());
        (addr, serde_json::to_vec(&record).unwrap())
    }

    #[test]
    fn family_of_strips_version_suffix() {
        assert_eq!(family_of("falcon1024-v1"), "falcon1024");
        assert_eq!(family_of("falcon1024-v12"), "falcon1024");
        assert_eq!(family_of("ed25519"), "ed25519");
        assert_eq!(family_of("my-vault"), "my-vault");
        assert_eq!(family_of("x-v"), "x-v");
    }

    #[test]
    fn load_sign_roundtrip() {
        let (_, data) = sample_record(9);
        let provider = Ed25519Provider;
        let material = provider.load_keys_from_data(&data).unwrap();
        assert_eq!(material.key_type, "ed25519");

        let sig = provider.sign(&material, b"message").unwrap();
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn load_rejects_mismatched_public_key() {
        let signing_key = SigningKey::from_bytes(&[1; 32]);
        let other = SigningKey::from_bytes(&[2; 32]);
        let record = KeyRecord {
            key_type: "ed25519".into(),
            public_key: hex::encode(other.verifying_key().to_bytes()),
            private_key: Some(hex::encode(signing_key.to_bytes())),
            lsig_bytecode: None,
            parameters: None,
            created_at: None,
        };
        let data = serde_json::to_vec(&record).unwrap();
        assert!(Ed25519Provider.load_keys_from_data(&data).is_err());
    }

    #[test]
    fn deriver_matches_direct_derivation() {
        let (addr, data) = sample_record(7);
        let record = KeyRecord::from_slice(&data).unwrap();
        let derived = Ed25519Deriver
            .derive_address(&record.public_key, None)
            .unwrap();
        assert_eq!(derived, addr);
    }

    #[test]
    fn wipe_clears_signing_key() {
        let (_, data) = sample_record(3);
        let mut material = Ed25519Provider.load_keys_from_data(&data).unwrap();
        material.wipe();
        match &material.value {
            KeyMaterialValue::Ed25519 { signing_key, .. } => {
                assert_eq!(signing_key.as_slice(), [0u8; 32].as_slice());
            }
            _ => panic!("unexpected material"),
        }
    }
}
