//! AEAD: AES-256-GCM with 12-byte nonces.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;
use zeroize::Zeroizing;

use crate::error::EnvelopeError;

pub const NONCE_LEN: usize = 12;

/// Generate a random 12-byte nonce. Used during sealing only.
pub fn fresh_nonce() -> Result<[u8; NONCE_LEN], EnvelopeError> {
    let mut n = [0u8; NONCE_LEN];
    getrandom(&mut n).map_err(|_| EnvelopeError::Crypto("rng"))?;
    Ok(n)
}

/// AEAD seal. Output is ciphertext || tag. Associated data is empty.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::Crypto("cipher init"))?;
    let n = Nonce::from_slice(nonce);
    cipher
        .encrypt(n, plaintext)
        .map_err(|_| EnvelopeError::Crypto("seal"))
}

/// AEAD open. Fails with `WrongKey` on tag mismatch; passphrase-path
/// callers remap to `WrongPassphrase`. The plaintext is wiped on drop.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::Crypto("cipher init"))?;
    let n = Nonce::from_slice(nonce);
    cipher
        .decrypt(n, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| EnvelopeError::WrongKey)
}
