//! Master-key derivation: Argon2id.
//!
//! The parameters are part of the on-disk file format. Changing them
//! breaks every existing store and backup, so they are constants here
//! rather than configuration.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

use crate::error::EnvelopeError;

pub const MASTER_KEY_LEN: usize = 32;

/// Argon2id parameters: 1 iteration over 64 MiB with 4 lanes.
pub const KDF_TIME_COST: u32 = 1;
pub const KDF_MEMORY_KIB: u32 = 65536;
pub const KDF_PARALLELISM: u32 = 4;

/// Derive the 32-byte master key from (passphrase, salt).
///
/// The returned key wipes itself on drop; callers that copy it out are
/// responsible for wiping their copy.
pub fn derive_master_key(
    passphrase: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>, EnvelopeError> {
    let params = Params::new(
        KDF_MEMORY_KIB,
        KDF_TIME_COST,
        KDF_PARALLELISM,
        Some(MASTER_KEY_LEN),
    )
    .map_err(|_| EnvelopeError::Crypto("kdf params"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    argon2
        .hash_password_into(passphrase, salt, key.as_mut_slice())
        .map_err(|_| EnvelopeError::Crypto("kdf"))?;
    Ok(key)
}
