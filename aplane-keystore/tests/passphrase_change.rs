//! Passphrase change through the full stack: a populated store keeps
//! every value across a master-key transition.

mod common;

use aplane_keystore::{
    KeyMaterialValue, KeyStore, KeystoreError, KeystoreMetadata, PassphraseChange,
    PassphraseHelper, TemplateKind,
};

use common::{ed25519_record, lsig_record, unlocked_env, MASTER_PASS};

const NEW_PASS: &[u8] = b"rotated-passphrase";

#[test]
fn change_preserves_keys_templates_and_material() {
    let env = unlocked_env();
    let master_key = env.store.master_key().unwrap();

    let (addr_a, _, bytes_a) = ed25519_record(1);
    let (addr_l, _, bytes_l) = lsig_record(&[0x06, 0x81, 0x01]);
    env.store.store(&addr_a, &bytes_a).unwrap();
    env.store.store(&addr_l, &bytes_l).unwrap();
    env.templates
        .save(b"logic: demo", "tealish", TemplateKind::Generic, &master_key)
        .unwrap();
    env.store.teardown();

    let change = PassphraseChange::new(env.layout.clone(), None);
    let report = change.change(MASTER_PASS, NEW_PASS).unwrap();
    assert_eq!(report.rewritten, 3);

    // Old passphrase no longer verifies; new one runs the whole store.
    let meta = KeystoreMetadata::load(env.layout.root()).unwrap().unwrap();
    assert!(matches!(
        meta.verify_and_derive(MASTER_PASS),
        Err(KeystoreError::WrongPassphrase)
    ));

    env.store.initialize_master_key(NEW_PASS).unwrap();
    env.store.scan().unwrap();

    let material = env.store.get(&addr_a).unwrap();
    assert_eq!(material.key_type, "ed25519");

    let material = env.store.get(&addr_l).unwrap();
    match &material.value {
        KeyMaterialValue::GenericLsig { bytecode } => {
            assert_eq!(bytecode, &[0x06, 0x81, 0x01]);
        }
        other => panic!("unexpected material: {:?}", other),
    }

    let new_key = env.store.master_key().unwrap();
    let template = env
        .templates
        .load("tealish", TemplateKind::Generic, &new_key)
        .unwrap()
        .expect("template survives the change");
    assert_eq!(&template[..], b"logic: demo");
}

#[test]
fn change_on_uninitialized_store_fails() {
    let dir = tempfile::tempdir().unwrap();
    let layout = aplane_keystore::StoreLayout::new(dir.path(), "default");
    let change = PassphraseChange::new(layout, None);
    assert!(matches!(
        change.change(MASTER_PASS, NEW_PASS),
        Err(KeystoreError::NotInitialized)
    ));
}

#[test]
fn helper_receives_the_new_passphrase_on_commit() {
    let env = unlocked_env();
    let (addr, _, bytes) = ed25519_record(2);
    env.store.store(&addr, &bytes).unwrap();
    env.store.teardown();

    let out = env.dir.path().join("helper-store");
    let helper = PassphraseHelper::new(vec![
        "sh".into(),
        "-c".into(),
        format!("cat > {}", out.display()),
    ])
    .unwrap();

    let change = PassphraseChange::new(env.layout.clone(), Some(helper));
    change.change(MASTER_PASS, NEW_PASS).unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), NEW_PASS);
    KeystoreMetadata::load(env.layout.root())
        .unwrap()
        .unwrap()
        .verify_and_derive(NEW_PASS)
        .unwrap();
}

#[test]
fn consecutive_changes_compose() {
    let env = unlocked_env();
    let (addr, _, bytes) = ed25519_record(3);
    env.store.store(&addr, &bytes).unwrap();
    env.store.teardown();

    let change = PassphraseChange::new(env.layout.clone(), None);
    change.change(MASTER_PASS, b"second").unwrap();
    change.change(b"second", b"third").unwrap();

    env.store.initialize_master_key(b"third").unwrap();
    env.store.scan().unwrap();
    env.store.get(&addr).unwrap();
}
