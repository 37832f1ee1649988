//! Error types for envelope sealing and opening.

use core::fmt;

/// Which opener rejected an envelope version. Only used for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opener {
    MasterKey,
    Passphrase,
}

impl Opener {
    fn label(&self) -> &'static str {
        match self {
            Opener::MasterKey => "master key",
            Opener::Passphrase => "passphrase",
        }
    }
}

#[derive(Debug)]
pub enum EnvelopeError {
    /// AEAD authentication failed under a master key believed correct.
    WrongKey,
    /// AEAD authentication failed on the passphrase-derived key.
    WrongPassphrase,
    /// The envelope parsed, but its version does not match the opener.
    WrongVersion { version: u32, opener: Opener },
    /// The envelope parsed, but its version is unknown to this build.
    UnsupportedVersion(u32),
    /// The bytes are not a well-formed envelope of the expected shape.
    Malformed(String),
    /// RNG, cipher init, or KDF parameter failure.
    Crypto(&'static str),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongKey => write!(f, "decryption failed: wrong master key or corrupt envelope"),
            Self::WrongPassphrase => write!(f, "decryption failed: wrong passphrase"),
            Self::WrongVersion { version, opener } => write!(
                f,
                "envelope version {} not supported by {} decryption",
                version,
                opener.label()
            ),
            Self::UnsupportedVersion(v) => write!(f, "unsupported envelope version {}", v),
            Self::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
            Self::Crypto(what) => write!(f, "crypto failure: {}", what),
        }
    }
}

impl std::error::Error for EnvelopeError {}
