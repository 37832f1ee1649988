//! The two envelope forms and their seal/open operations.
//!
//! Serialized shape (JSON, base64 binary fields):
//!
//! ```text
//! V1: { "envelope_version": 1, "nonce": b64, "ciphertext": b64 }
//! V2: { "envelope_version": 2, "salt": b64(32), "nonce": b64, "ciphertext": b64 }
//! ```
//!
//! The ciphertext field carries the AEAD tag. Each opener refuses the
//! other form's version so a backup file can never be mistaken for a
//! store record, and a V2 passphrase failure is never misreported as a
//! master-key failure.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use getrandom::getrandom;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::aead::{aead_open, aead_seal, fresh_nonce, NONCE_LEN};
use crate::error::{EnvelopeError, Opener};
use crate::kdf::derive_master_key;

pub const ENVELOPE_V1_MASTER_KEY: u32 = 1;
pub const ENVELOPE_V2_STANDALONE: u32 = 2;

/// Length of the random KDF salt embedded in a V2 envelope.
pub const SALT_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct EnvelopeFile {
    envelope_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    nonce: String,
    ciphertext: String,
}

// ---------------------------------------------------------------------------
// V1: master-key envelopes
// ---------------------------------------------------------------------------

/// Seal `plaintext` under a 32-byte master key as a V1 envelope.
pub fn seal_with_master_key(
    plaintext: &[u8],
    master_key: &[u8; 32],
) -> Result<Vec<u8>, EnvelopeError> {
    let nonce = fresh_nonce()?;
    let ciphertext = aead_seal(master_key, &nonce, plaintext)?;

    let file = EnvelopeFile {
        envelope_version: ENVELOPE_V1_MASTER_KEY,
        salt: None,
        nonce: B64.encode(nonce),
        ciphertext: B64.encode(&ciphertext),
    };
    serde_json::to_vec(&file).map_err(|_| EnvelopeError::Crypto("serialize"))
}

/// Open a V1 envelope with a master key.
pub fn open_with_master_key(
    bytes: &[u8],
    master_key: &[u8; 32],
) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
    let file = parse(bytes)?;
    if file.envelope_version != ENVELOPE_V1_MASTER_KEY {
        return Err(EnvelopeError::WrongVersion {
            version: file.envelope_version,
            opener: Opener::MasterKey,
        });
    }
    let (nonce, ciphertext) = decode_fields(&file)?;
    aead_open(master_key, &nonce, &ciphertext)
}

// ---------------------------------------------------------------------------
// V2: standalone (passphrase) envelopes
// ---------------------------------------------------------------------------

/// Seal `plaintext` under a passphrase as a self-contained V2 envelope.
///
/// Generates a fresh 32-byte salt, derives a one-shot key, and wipes
/// the key before returning.
pub fn seal_with_passphrase(
    plaintext: &[u8],
    passphrase: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom(&mut salt).map_err(|_| EnvelopeError::Crypto("rng"))?;

    let key = derive_master_key(passphrase, &salt)?;
    let nonce = fresh_nonce()?;
    let ciphertext = aead_seal(&key, &nonce, plaintext)?;

    let file = EnvelopeFile {
        envelope_version: ENVELOPE_V2_STANDALONE,
        salt: Some(B64.encode(salt)),
        nonce: B64.encode(nonce),
        ciphertext: B64.encode(&ciphertext),
    };
    serde_json::to_vec(&file).map_err(|_| EnvelopeError::Crypto("serialize"))
}

/// Open a V2 envelope by re-deriving the key from the embedded salt.
pub fn open_with_passphrase(
    bytes: &[u8],
    passphrase: &[u8],
) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
    let file = parse(bytes)?;
    if file.envelope_version != ENVELOPE_V2_STANDALONE {
        return Err(EnvelopeError::WrongVersion {
            version: file.envelope_version,
            opener: Opener::Passphrase,
        });
    }

    let salt_b64 = file
        .salt
        .as_deref()
        .ok_or_else(|| EnvelopeError::Malformed("v2 envelope missing salt".into()))?;
    let salt = B64
        .decode(salt_b64)
        .map_err(|_| EnvelopeError::Malformed("salt is not valid base64".into()))?;
    if salt.len() != SALT_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "salt is {} bytes, expected {}",
            salt.len(),
            SALT_LEN
        )));
    }

    let key = derive_master_key(passphrase, &salt)?;
    let (nonce, ciphertext) = decode_fields(&file)?;
    aead_open(&key, &nonce, &ciphertext).map_err(|e| match e {
        EnvelopeError::WrongKey => EnvelopeError::WrongPassphrase,
        other => other,
    })
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Whether `bytes` look like an encrypted envelope.
///
/// True iff the bytes parse as an envelope whose version field is
/// strictly positive. Anything else is treated as plaintext by callers
/// (the legacy unencrypted-payload path).
pub fn is_encrypted(bytes: &[u8]) -> bool {
    matches!(peek_version(bytes), Some(v) if v > 0)
}

/// Read the version field without attempting decryption.
pub fn peek_version(bytes: &[u8]) -> Option<u32> {
    serde_json::from_slice::<EnvelopeFile>(bytes)
        .ok()
        .map(|f| f.envelope_version)
}

// ---------------------------------------------------------------------------
// Field decoding
// ---------------------------------------------------------------------------

fn parse(bytes: &[u8]) -> Result<EnvelopeFile, EnvelopeError> {
    serde_json::from_slice(bytes)
        .map_err(|e| EnvelopeError::Malformed(format!("not an envelope: {}", e)))
}

fn decode_fields(file: &EnvelopeFile) -> Result<([u8; NONCE_LEN], Vec<u8>), EnvelopeError> {
    let nonce_bytes = B64
        .decode(&file.nonce)
        .map_err(|_| EnvelopeError::Malformed("nonce is not valid base64".into()))?;
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::Malformed("nonce is not 12 bytes".into()))?;
    let ciphertext = B64
        .decode(&file.ciphertext)
        .map_err(|_| EnvelopeError::Malformed("ciphertext is not valid base64".into()))?;
    Ok((nonce, ciphertext))
}
