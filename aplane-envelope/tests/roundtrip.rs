use aplane_envelope::{
    derive_master_key, is_encrypted, open_with_master_key, open_with_passphrase, peek_version,
    seal_with_master_key, seal_with_passphrase, EnvelopeError, ENVELOPE_V1_MASTER_KEY,
    ENVELOPE_V2_STANDALONE,
};

fn test_key() -> [u8; 32] {
    [0x42u8; 32]
}

#[test]
fn v1_roundtrip_basic() {
    let key = test_key();
    let sealed = seal_with_master_key(b"hello keystore", &key).unwrap();
    let opened = open_with_master_key(&sealed, &key).unwrap();
    assert_eq!(&opened[..], b"hello keystore");
}

#[test]
fn v1_roundtrip_empty_plaintext() {
    let key = test_key();
    let sealed = seal_with_master_key(b"", &key).unwrap();
    let opened = open_with_master_key(&sealed, &key).unwrap();
    assert!(opened.is_empty());
}

#[test]
fn v1_roundtrip_large_plaintext() {
    let key = test_key();
    let plaintext = vec![0xABu8; 65536];
    let sealed = seal_with_master_key(&plaintext, &key).unwrap();
    let opened = open_with_master_key(&sealed, &key).unwrap();
    assert_eq!(&opened[..], &plaintext[..]);
}

#[test]
fn v1_wrong_key_fails() {
    let sealed = seal_with_master_key(b"data", &test_key()).unwrap();
    let other = [0x17u8; 32];
    assert!(matches!(
        open_with_master_key(&sealed, &other),
        Err(EnvelopeError::WrongKey)
    ));
}

#[test]
fn v1_nonce_is_fresh_per_seal() {
    let key = test_key();
    let a = seal_with_master_key(b"x", &key).unwrap();
    let b = seal_with_master_key(b"x", &key).unwrap();
    assert_ne!(a, b);
    assert_eq!(&open_with_master_key(&a, &key).unwrap()[..], b"x");
    assert_eq!(&open_with_master_key(&b, &key).unwrap()[..], b"x");
}

#[test]
fn v2_roundtrip_basic() {
    let sealed = seal_with_passphrase(b"portable backup", b"correct horse").unwrap();
    let opened = open_with_passphrase(&sealed, b"correct horse").unwrap();
    assert_eq!(&opened[..], b"portable backup");
}

#[test]
fn v2_wrong_passphrase_fails() {
    let sealed = seal_with_passphrase(b"data", b"pass").unwrap();
    assert!(matches!(
        open_with_passphrase(&sealed, b"not-pass"),
        Err(EnvelopeError::WrongPassphrase)
    ));
}

#[test]
fn v2_salt_is_fresh_per_seal() {
    let a = seal_with_passphrase(b"x", b"pass").unwrap();
    let b = seal_with_passphrase(b"x", b"pass").unwrap();
    assert_ne!(a, b);
}

#[test]
fn openers_reject_each_others_envelopes() {
    let key = test_key();

    let v2 = seal_with_passphrase(b"data", b"pass").unwrap();
    let err = open_with_master_key(&v2, &key).unwrap_err();
    assert!(matches!(err, EnvelopeError::WrongVersion { version: 2, .. }));
    assert!(err.to_string().contains("not supported by master key decryption"));

    let v1 = seal_with_master_key(b"data", &key).unwrap();
    let err = open_with_passphrase(&v1, b"pass").unwrap_err();
    assert!(matches!(err, EnvelopeError::WrongVersion { version: 1, .. }));
    assert!(err.to_string().contains("not supported by passphrase decryption"));
}

#[test]
fn detection_of_envelopes_and_plaintext() {
    let key = test_key();
    let v1 = seal_with_master_key(b"data", &key).unwrap();
    let v2 = seal_with_passphrase(b"data", b"pass").unwrap();

    assert!(is_encrypted(&v1));
    assert!(is_encrypted(&v2));
    assert_eq!(peek_version(&v1), Some(ENVELOPE_V1_MASTER_KEY));
    assert_eq!(peek_version(&v2), Some(ENVELOPE_V2_STANDALONE));

    assert!(!is_encrypted(b"just some text"));
    assert!(!is_encrypted(b"{\"key_type\":\"ed25519\"}"));
    assert!(!is_encrypted(b"{\"envelope_version\":0,\"nonce\":\"\",\"ciphertext\":\"\"}"));
    assert!(!is_encrypted(b""));
}

#[test]
fn truncated_envelope_is_malformed() {
    let key = test_key();
    let sealed = seal_with_master_key(b"data", &key).unwrap();
    let truncated = &sealed[..sealed.len() / 2];
    assert!(matches!(
        open_with_master_key(truncated, &key),
        Err(EnvelopeError::Malformed(_))
    ));
}

#[test]
fn tampered_ciphertext_fails_auth() {
    let key = test_key();
    let sealed = seal_with_master_key(b"data", &key).unwrap();
    // Flip a character inside the base64 ciphertext field.
    let text = String::from_utf8(sealed).unwrap();
    let pos = text.find("\"ciphertext\":\"").unwrap() + 15;
    let mut bytes = text.into_bytes();
    bytes[pos] = if bytes[pos] == b'A' { b'B' } else { b'A' };
    let result = open_with_master_key(&bytes, &key);
    assert!(matches!(
        result,
        Err(EnvelopeError::WrongKey) | Err(EnvelopeError::Malformed(_))
    ));
}

#[test]
fn kdf_is_deterministic_for_fixed_inputs() {
    let salt = [7u8; 32];
    let a = derive_master_key(b"passphrase", &salt).unwrap();
    let b = derive_master_key(b"passphrase", &salt).unwrap();
    assert_eq!(a[..], b[..]);

    let c = derive_master_key(b"other", &salt).unwrap();
    assert_ne!(a[..], c[..]);
}

// ---------------------------------------------------------------------------
// Property tests (V1 only: the V2 path pays a 64 MiB KDF per case)
// ---------------------------------------------------------------------------

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn v1_roundtrip_any_plaintext(
            plaintext in proptest::collection::vec(any::<u8>(), 0..4096),
            key in proptest::array::uniform32(any::<u8>()),
        ) {
            let sealed = seal_with_master_key(&plaintext, &key).unwrap();
            prop_assert!(is_encrypted(&sealed));
            let opened = open_with_master_key(&sealed, &key).unwrap();
            prop_assert_eq!(&opened[..], &plaintext[..]);
        }

        #[test]
        fn v1_two_seals_differ(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            key in proptest::array::uniform32(any::<u8>()),
        ) {
            let a = seal_with_master_key(&plaintext, &key).unwrap();
            let b = seal_with_master_key(&plaintext, &key).unwrap();
            prop_assert_ne!(a, b);
        }
    }
}
