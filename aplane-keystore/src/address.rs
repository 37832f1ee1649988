//! Algorand address derivation.
//!
//! An address is the base32 (no padding) encoding of a 32-byte public
//! key followed by the last 4 bytes of its SHA-512/256 digest. For
//! LogicSig programs the "public key" is the program hash:
//! SHA-512/256("Program" || bytecode).

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha512_256};

const CHECKSUM_LEN: usize = 4;
const PROGRAM_DOMAIN_PREFIX: &[u8] = b"Program";

/// Derive the account address for an ed25519 public key.
pub fn address_from_public_key(public_key: &[u8; 32]) -> String {
    encode_address(public_key)
}

/// Derive the escrow address of a LogicSig program from its bytecode.
pub fn address_from_lsig_bytecode(bytecode: &[u8]) -> String {
    let mut hasher = Sha512_256::new();
    hasher.update(PROGRAM_DOMAIN_PREFIX);
    hasher.update(bytecode);
    let digest: [u8; 32] = hasher.finalize().into();
    encode_address(&digest)
}

fn encode_address(key: &[u8; 32]) -> String {
    let digest = Sha512_256::digest(key);
    let checksum = &digest[digest.len() - CHECKSUM_LEN..];

    let mut raw = [0u8; 32 + CHECKSUM_LEN];
    raw[..32].copy_from_slice(key);
    raw[32..].copy_from_slice(checksum);
    BASE32_NOPAD.encode(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_key_address_matches_known_vector() {
        // The all-zero public key encodes to the well-known zero address.
        let addr = address_from_public_key(&[0u8; 32]);
        assert_eq!(
            addr,
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAY5HFKQ"
        );
    }

    #[test]
    fn addresses_are_58_chars() {
        let addr = address_from_public_key(&[0xFFu8; 32]);
        assert_eq!(addr.len(), 58);
        let addr = address_from_lsig_bytecode(&[0x06, 0x81, 0x01]);
        assert_eq!(addr.len(), 58);
    }

    #[test]
    fn lsig_address_depends_on_bytecode() {
        let a = address_from_lsig_bytecode(&[0x06, 0x81, 0x01]);
        let b = address_from_lsig_bytecode(&[0x06, 0x81, 0x00]);
        assert_ne!(a, b);
    }

    #[test]
    fn lsig_address_differs_from_raw_hash_as_key() {
        // The "Program" domain prefix must participate in the hash.
        let bytecode = [0x06u8, 0x81, 0x01];
        let without_prefix: [u8; 32] = Sha512_256::digest(bytecode).into();
        assert_ne!(
            address_from_lsig_bytecode(&bytecode),
            address_from_public_key(&without_prefix)
        );
    }
}
