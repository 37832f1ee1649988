//! # aplane-envelope
//!
//! Sealing primitives for the aplane signing keystore: the two on-disk
//! envelope forms, the Argon2id master-key derivation, and a wiped
//! secret buffer.
//!
//! An envelope is a small JSON blob carrying an AES-256-GCM ciphertext
//! and the parameters needed to open it:
//!
//! - **V1 (master key)**: `{ envelope_version: 1, nonce, ciphertext }`.
//!   Opened with a 32-byte master key the caller already holds. Used
//!   for every key and template record inside the store.
//! - **V2 (standalone)**: `{ envelope_version: 2, salt, nonce,
//!   ciphertext }`. Carries its own KDF salt so it can be opened with a
//!   passphrase alone. Used for portable backup bundles.
//!
//! This crate performs no filesystem I/O; callers hand it bytes.

pub mod aead;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod secure;

pub use envelope::{
    is_encrypted, open_with_master_key, open_with_passphrase, peek_version, seal_with_master_key,
    seal_with_passphrase, ENVELOPE_V1_MASTER_KEY, ENVELOPE_V2_STANDALONE, SALT_LEN,
};
pub use error::EnvelopeError;
pub use kdf::{derive_master_key, MASTER_KEY_LEN};
pub use secure::SecureBuffer;
