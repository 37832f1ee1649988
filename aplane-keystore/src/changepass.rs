//! Passphrase change: a crash-safe rewrite of the entire store under a
//! new master key.
//!
//! Three phases over every encrypted artifact (key records, templates,
//! then the metadata file last):
//!
//!   1. Prepare: stage `P.new` siblings sealed under the new key and
//!      verify each one decrypts back to the original plaintext. The
//!      canonical store is untouched; any failure unlinks the staging
//!      files and aborts.
//!   2. Commit: rename `P` to `P.old` and `P.new` to `P`, in a stable
//!      order ending with `.keystore`. A failure mid-loop rolls every
//!      completed swap back. The metadata file goes last so a crash
//!      before its swap leaves the old passphrase able to open
//!      everything not yet swapped, and `.old` siblings cover the rest.
//!   3. Cleanup: unlink `.old` siblings and wipe the old key.
//!
//! `recover` replays the same decision against an arbitrary crash-state
//! directory: staging metadata still present means roll back, otherwise
//! the change committed and leftovers are swept forward.

use std::io;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use aplane_envelope::{is_encrypted, open_with_master_key, seal_with_master_key, MASTER_KEY_LEN};

use crate::error::KeystoreError;
use crate::fsutil;
use crate::helper::PassphraseHelper;
use crate::metadata::{master_key_bytes, metadata_path, KeystoreMetadata};
use crate::types::{StoreLayout, TemplateKind, KEY_FILE_EXT, TEMPLATE_FILE_EXT};

const NEW_SUFFIX: &str = "new";
const OLD_SUFFIX: &str = "old";

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct ChangeReport {
    /// Artifacts rewritten under the new key.
    pub rewritten: usize,
    /// Unencrypted files left untouched, with a note in the log.
    pub skipped: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No partial change found.
    Clean,
    /// A commit was in flight; the pre-change store was restored.
    RolledBack { restored: usize },
    /// The change had committed; leftover backups were swept.
    CompletedForward { cleaned: usize },
}

pub struct PassphraseChange {
    layout: StoreLayout,
    helper: Option<PassphraseHelper>,
}

impl PassphraseChange {
    pub fn new(layout: StoreLayout, helper: Option<PassphraseHelper>) -> Self {
        Self { layout, helper }
    }

    /// Transition the store from `old_passphrase` to `new_passphrase`.
    pub fn change(
        &self,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Result<ChangeReport, KeystoreError> {
        self.change_with(old_passphrase, new_passphrase, &mut FsRenameOps)
    }

    pub(crate) fn change_with(
        &self,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
        ops: &mut dyn RenameOps,
    ) -> Result<ChangeReport, KeystoreError> {
        if new_passphrase.is_empty() {
            return Err(KeystoreError::EmptyPassphrase);
        }
        if new_passphrase == old_passphrase {
            return Err(KeystoreError::PassphraseUnchanged);
        }

        let meta = KeystoreMetadata::load(self.layout.root())?
            .ok_or(KeystoreError::NotInitialized)?;
        let old_key_buf = meta.verify_and_derive(old_passphrase)?;
        let old_key = master_key_bytes(&old_key_buf)?;

        let prepared = self.prepare(&old_key, new_passphrase)?;
        self.commit(&prepared, ops)?;
        self.cleanup(&prepared);
        old_key_buf.destroy();

        tracing::info!(
            rewritten = prepared.staged.len(),
            skipped = prepared.skipped.len(),
            "passphrase change committed"
        );
        Ok(ChangeReport {
            rewritten: prepared.staged.len(),
            skipped: prepared.skipped.len(),
        })
    }

    // -----------------------------------------------------------------------
    // Phase 1: prepare
    // -----------------------------------------------------------------------

    fn prepare(
        &self,
        old_key: &[u8; MASTER_KEY_LEN],
        new_passphrase: &[u8],
    ) -> Result<Prepared, KeystoreError> {
        let (new_meta, new_key_buf) = KeystoreMetadata::create_in_memory(new_passphrase)?;
        let new_key = master_key_bytes(&new_key_buf)?;
        new_key_buf.destroy();

        let mut staged: Vec<PathBuf> = Vec::new();
        let mut skipped: Vec<PathBuf> = Vec::new();

        let result = (|| -> Result<(), KeystoreError> {
            for path in self.enumerate_artifacts()? {
                let bytes = std::fs::read(&path).map_err(|e| {
                    KeystoreError::changepass(
                        path.display().to_string(),
                        KeystoreError::io("read", e),
                    )
                })?;
                if !is_encrypted(&bytes) {
                    tracing::warn!(file = %path.display(), "not encrypted, left as-is");
                    skipped.push(path);
                    continue;
                }

                let plaintext = open_with_master_key(&bytes, old_key)
                    .map_err(|e| KeystoreError::changepass(path.display().to_string(), e.into()))?;
                let resealed = seal_with_master_key(&plaintext, &new_key)
                    .map_err(|e| KeystoreError::changepass(path.display().to_string(), e.into()))?;

                let staging = sibling(&path, NEW_SUFFIX);
                fsutil::atomic_write(&staging, &resealed, fsutil::FILE_MODE_GROUP).map_err(|e| {
                    KeystoreError::changepass(
                        staging.display().to_string(),
                        KeystoreError::io("write", e),
                    )
                })?;
                staged.push(path.clone());

                // Read the staging copy back and prove it decrypts to the
                // original plaintext before the canonical file is touched.
                let reread = std::fs::read(&staging).map_err(|e| {
                    KeystoreError::changepass(
                        staging.display().to_string(),
                        KeystoreError::io("read back", e),
                    )
                })?;
                let reopened = open_with_master_key(&reread, &new_key).map_err(|e| {
                    KeystoreError::changepass(staging.display().to_string(), e.into())
                })?;
                if reopened[..] != plaintext[..] {
                    return Err(KeystoreError::changepass(
                        staging.display().to_string(),
                        KeystoreError::Malformed("staging copy does not match original".into()),
                    ));
                }
                // plaintexts wiped on drop here
            }

            // Stage the new metadata and prove the new key opens its check.
            let meta_path = metadata_path(self.layout.root());
            let staging = sibling(&meta_path, NEW_SUFFIX);
            let json = serde_json::to_vec_pretty(&new_meta)
                .map_err(|e| KeystoreError::Malformed(format!("serialize metadata: {}", e)))?;
            fsutil::atomic_write(&staging, &json, fsutil::FILE_MODE_PRIVATE).map_err(|e| {
                KeystoreError::changepass(
                    staging.display().to_string(),
                    KeystoreError::io("write", e),
                )
            })?;

            let reread = std::fs::read(&staging).map_err(|e| {
                KeystoreError::changepass(
                    staging.display().to_string(),
                    KeystoreError::io("read back", e),
                )
            })?;
            let reloaded: KeystoreMetadata = serde_json::from_slice(&reread)
                .map_err(|e| KeystoreError::Malformed(format!("staged metadata: {}", e)))?;
            reloaded
                .verify_master_key(&new_key)
                .map_err(|e| KeystoreError::changepass(staging.display().to_string(), e))?;
            Ok(())
        })();

        if let Err(e) = result {
            // Abort: the canonical store is untouched; drop the staging files.
            for path in &staged {
                let _ = std::fs::remove_file(sibling(path, NEW_SUFFIX));
            }
            let _ = std::fs::remove_file(sibling(&metadata_path(self.layout.root()), NEW_SUFFIX));
            return Err(e);
        }

        Ok(Prepared {
            staged,
            skipped,
            metadata: metadata_path(self.layout.root()),
            new_key,
            new_passphrase: Zeroizing::new(new_passphrase.to_vec()),
        })
    }

    // -----------------------------------------------------------------------
    // Phase 2: commit
    // -----------------------------------------------------------------------

    fn commit(&self, prepared: &Prepared, ops: &mut dyn RenameOps) -> Result<(), KeystoreError> {
        let mut ordered: Vec<&PathBuf> = prepared.staged.iter().collect();
        ordered.push(&prepared.metadata);

        // Canonical paths whose swap completed, in order.
        let mut installed: Vec<PathBuf> = Vec::new();

        for (idx, path) in ordered.iter().enumerate() {
            let backup = sibling(path, OLD_SUFFIX);
            let staging = sibling(path, NEW_SUFFIX);

            let step = (|| -> io::Result<()> {
                if path.exists() {
                    ops.rename(path, &backup)?;
                }
                match ops.rename(&staging, path) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // The canonical name is empty; put the backup straight back.
                        let _ = std::fs::rename(&backup, path);
                        Err(e)
                    }
                }
            })();

            match step {
                Ok(()) => installed.push((*path).clone()),
                Err(e) => {
                    self.rollback(&installed, &ordered[idx..]);
                    return Err(KeystoreError::changepass(
                        path.display().to_string(),
                        KeystoreError::io("commit rename", e),
                    ));
                }
            }
        }

        if let Some(helper) = &self.helper {
            if let Err(e) = helper.write(&prepared.new_passphrase) {
                self.rollback(&installed, &[]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Undo completed swaps and drop staging files that never landed.
    fn rollback(&self, installed: &[PathBuf], remaining: &[&PathBuf]) {
        for path in installed.iter().rev() {
            let backup = sibling(path, OLD_SUFFIX);
            if let Err(e) = std::fs::rename(&backup, path) {
                tracing::error!(file = %path.display(), error = %e, "rollback rename failed");
            }
        }
        for path in remaining {
            let _ = std::fs::remove_file(sibling(path, NEW_SUFFIX));
        }
        tracing::warn!(restored = installed.len(), "passphrase change rolled back");
    }

    // -----------------------------------------------------------------------
    // Phase 3: cleanup
    // -----------------------------------------------------------------------

    fn cleanup(&self, prepared: &Prepared) {
        for path in prepared.staged.iter().chain(std::iter::once(&prepared.metadata)) {
            let _ = std::fs::remove_file(sibling(path, OLD_SUFFIX));
        }
    }

    // -----------------------------------------------------------------------
    // Artifact enumeration
    // -----------------------------------------------------------------------

    /// Every encrypted artifact except the metadata file, in a stable
    /// order: key records first, then templates, each sorted by path.
    fn enumerate_artifacts(&self) -> Result<Vec<PathBuf>, KeystoreError> {
        let mut keys = list_files(&self.layout.keys_dir(), KEY_FILE_EXT)?;
        keys.sort();

        let mut templates = Vec::new();
        for kind in TemplateKind::all() {
            templates.extend(list_files(&self.layout.templates_dir(kind), TEMPLATE_FILE_EXT)?);
        }
        templates.sort();

        keys.extend(templates);
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Repair a store left behind by a crash during a passphrase change.
///
/// If the staged metadata (`.keystore.new`) is still present, the
/// change never committed: every `.old` backup is restored and every
/// staging file unlinked. Otherwise, if `.old` backups remain, the
/// change committed (the metadata swap is last) and the backups are
/// swept. A store with neither is clean.
pub fn recover(layout: &StoreLayout) -> Result<RecoveryOutcome, KeystoreError> {
    let olds = leftover_files(layout, OLD_SUFFIX)?;
    let news = leftover_files(layout, NEW_SUFFIX)?;

    let staged_metadata = sibling(&metadata_path(layout.root()), NEW_SUFFIX);
    if staged_metadata.exists() {
        let mut restored = 0;
        for old in &olds {
            let canonical = strip_suffix(old);
            std::fs::rename(old, &canonical)
                .map_err(|e| KeystoreError::io(format!("restore {}", canonical.display()), e))?;
            restored += 1;
        }
        for new in &news {
            let _ = std::fs::remove_file(new);
        }
        tracing::warn!(restored, "interrupted passphrase change rolled back");
        return Ok(RecoveryOutcome::RolledBack { restored });
    }

    if !olds.is_empty() || !news.is_empty() {
        let mut cleaned = 0;
        for path in olds.iter().chain(news.iter()) {
            let _ = std::fs::remove_file(path);
            cleaned += 1;
        }
        tracing::info!(cleaned, "completed passphrase change swept forward");
        return Ok(RecoveryOutcome::CompletedForward { cleaned });
    }

    Ok(RecoveryOutcome::Clean)
}

// ---------------------------------------------------------------------------
// Rename seam (crash points are injected here in tests)
// ---------------------------------------------------------------------------

pub(crate) trait RenameOps {
    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()>;
}

pub(crate) struct FsRenameOps;

impl RenameOps for FsRenameOps {
    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct Prepared {
    /// Canonical paths with a verified `.new` sibling.
    staged: Vec<PathBuf>,
    /// Unencrypted files left alone.
    skipped: Vec<PathBuf>,
    metadata: PathBuf,
    new_key: Zeroizing<[u8; MASTER_KEY_LEN]>,
    new_passphrase: Zeroizing<Vec<u8>>,
}

/// `P` → `P.new` / `P.old`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn strip_suffix(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stripped = name
        .strip_suffix(&format!(".{}", OLD_SUFFIX))
        .or_else(|| name.strip_suffix(&format!(".{}", NEW_SUFFIX)))
        .unwrap_or(name);
    path.with_file_name(stripped)
}

fn list_files(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, KeystoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KeystoreError::io(format!("list {}", dir.display()), e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KeystoreError::io(format!("list {}", dir.display()), e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            out.push(path);
        }
    }
    Ok(out)
}

/// Files under the store (root, keys, templates) carrying a `.old` or
/// `.new` suffix.
fn leftover_files(layout: &StoreLayout, suffix: &str) -> Result<Vec<PathBuf>, KeystoreError> {
    let mut dirs = vec![layout.root().to_path_buf(), layout.keys_dir()];
    for kind in TemplateKind::all() {
        dirs.push(layout.templates_dir(kind));
    }

    let wanted = format!(".{}", suffix);
    let mut out = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(KeystoreError::io(format!("list {}", dir.display()), e)),
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| KeystoreError::io(format!("list {}", dir.display()), e))?;
            let path = entry.path();
            if path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(&wanted))
                    .unwrap_or(false)
            {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::FILE_MODE_GROUP;
    use crate::metadata::KeystoreMetadata;

    const OLD_PASS: &[u8] = b"old-passphrase";
    const NEW_PASS: &[u8] = b"new-passphrase";

    /// A rename seam that fails the Nth rename (1-based).
    struct FailAt {
        fail_on: usize,
        seen: usize,
    }

    impl RenameOps for FailAt {
        fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
            self.seen += 1;
            if self.seen == self.fail_on {
                return Err(io::Error::other("injected rename failure"));
            }
            std::fs::rename(from, to)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: StoreLayout,
        old_key: Zeroizing<[u8; 32]>,
        /// (canonical path, plaintext) of every seeded artifact.
        artifacts: Vec<(PathBuf, Vec<u8>)>,
    }

    fn seed_store() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "default");
        let (_meta, key_buf) = KeystoreMetadata::create(dir.path(), OLD_PASS).unwrap();
        let old_key = master_key_bytes(&key_buf).unwrap();
        key_buf.destroy();

        let mut artifacts = Vec::new();
        for (name, body) in [
            ("ADDRA", br#"{"key_type":"ed25519","public_key":"aa"}"#.as_slice()),
            ("ADDRB", br#"{"key_type":"falcon1024","public_key":"bb"}"#.as_slice()),
        ] {
            let path = layout.key_path(name);
            let sealed = seal_with_master_key(body, &old_key).unwrap();
            fsutil::atomic_write(&path, &sealed, FILE_MODE_GROUP).unwrap();
            artifacts.push((path, body.to_vec()));
        }
        let tmpl = layout.template_path("falcon1024", TemplateKind::DsaLsig);
        let sealed = seal_with_master_key(b"template-body", &old_key).unwrap();
        fsutil::atomic_write(&tmpl, &sealed, FILE_MODE_GROUP).unwrap();
        artifacts.push((tmpl, b"template-body".to_vec()));

        Fixture {
            _dir: dir,
            layout,
            old_key,
            artifacts,
        }
    }

    fn open_all_under(fixture: &Fixture, key: &[u8; 32]) -> bool {
        fixture.artifacts.iter().all(|(path, plaintext)| {
            let bytes = std::fs::read(path).unwrap();
            open_with_master_key(&bytes, key)
                .map(|p| &p[..] == &plaintext[..])
                .unwrap_or(false)
        })
    }

    fn no_leftovers(layout: &StoreLayout) -> bool {
        leftover_files(layout, NEW_SUFFIX).unwrap().is_empty()
            && leftover_files(layout, OLD_SUFFIX).unwrap().is_empty()
    }

    #[test]
    fn change_preserves_every_plaintext() {
        let fixture = seed_store();
        let change = PassphraseChange::new(fixture.layout.clone(), None);
        let report = change.change(OLD_PASS, NEW_PASS).unwrap();
        assert_eq!(report.rewritten, 3);
        assert_eq!(report.skipped, 0);

        let meta = KeystoreMetadata::load(fixture.layout.root()).unwrap().unwrap();
        assert!(matches!(
            meta.verify_and_derive(OLD_PASS),
            Err(KeystoreError::WrongPassphrase)
        ));
        let new_key_buf = meta.verify_and_derive(NEW_PASS).unwrap();
        let new_key = master_key_bytes(&new_key_buf).unwrap();

        assert!(open_all_under(&fixture, &new_key));
        assert!(!open_all_under(&fixture, &fixture.old_key));
        assert!(no_leftovers(&fixture.layout));
    }

    #[test]
    fn preconditions_enforced() {
        let fixture = seed_store();
        let change = PassphraseChange::new(fixture.layout.clone(), None);
        assert!(matches!(
            change.change(OLD_PASS, b""),
            Err(KeystoreError::EmptyPassphrase)
        ));
        assert!(matches!(
            change.change(OLD_PASS, OLD_PASS),
            Err(KeystoreError::PassphraseUnchanged)
        ));
        assert!(matches!(
            change.change(b"not-the-passphrase", NEW_PASS),
            Err(KeystoreError::WrongPassphrase)
        ));
    }

    #[test]
    fn unencrypted_artifacts_are_skipped() {
        let fixture = seed_store();
        let stray = fixture.layout.key_path("PLAIN");
        fsutil::atomic_write(&stray, b"not an envelope", FILE_MODE_GROUP).unwrap();

        let change = PassphraseChange::new(fixture.layout.clone(), None);
        let report = change.change(OLD_PASS, NEW_PASS).unwrap();
        assert_eq!(report.rewritten, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(std::fs::read(&stray).unwrap(), b"not an envelope");
    }

    #[test]
    fn every_commit_crash_point_rolls_back_clean() {
        // 3 artifacts + metadata, two renames each: 8 rename calls.
        for fail_on in 1..=8 {
            let fixture = seed_store();
            let change = PassphraseChange::new(fixture.layout.clone(), None);
            let mut ops = FailAt { fail_on, seen: 0 };

            let err = change.change_with(OLD_PASS, NEW_PASS, &mut ops);
            assert!(err.is_err(), "fail_on={} should error", fail_on);

            // Everything opens under the old key and staging is gone.
            assert!(
                open_all_under(&fixture, &fixture.old_key),
                "fail_on={}: store must be the pre-change store",
                fail_on
            );
            let meta = KeystoreMetadata::load(fixture.layout.root()).unwrap().unwrap();
            meta.verify_and_derive(OLD_PASS).unwrap();
            assert!(no_leftovers(&fixture.layout), "fail_on={}", fail_on);
        }
    }

    #[test]
    fn helper_refusal_rolls_back() {
        let fixture = seed_store();
        let helper = PassphraseHelper::new(vec!["false".into()]).unwrap();
        let change = PassphraseChange::new(fixture.layout.clone(), Some(helper));

        assert!(matches!(
            change.change(OLD_PASS, NEW_PASS),
            Err(KeystoreError::HelperWriteFailed(_))
        ));
        assert!(open_all_under(&fixture, &fixture.old_key));
        let meta = KeystoreMetadata::load(fixture.layout.root()).unwrap().unwrap();
        meta.verify_and_derive(OLD_PASS).unwrap();
        assert!(no_leftovers(&fixture.layout));
    }

    #[test]
    fn recover_rolls_back_interrupted_commit() {
        let fixture = seed_store();
        let change = PassphraseChange::new(fixture.layout.clone(), None);

        // Crash after the first artifact's swap: simulate by staging
        // everything, then swapping only the first artifact.
        let prepared = change.prepare(&fixture.old_key, NEW_PASS).unwrap();
        let first = &prepared.staged[0];
        std::fs::rename(first, sibling(first, OLD_SUFFIX)).unwrap();
        std::fs::rename(sibling(first, NEW_SUFFIX), first).unwrap();

        let outcome = recover(&fixture.layout).unwrap();
        assert!(matches!(outcome, RecoveryOutcome::RolledBack { restored: 1 }));
        assert!(open_all_under(&fixture, &fixture.old_key));
        assert!(no_leftovers(&fixture.layout));
    }

    #[test]
    fn recover_sweeps_committed_change_forward() {
        let fixture = seed_store();
        let change = PassphraseChange::new(fixture.layout.clone(), None);

        // Crash between commit and cleanup: run the full commit, skip cleanup.
        let prepared = change.prepare(&fixture.old_key, NEW_PASS).unwrap();
        change.commit(&prepared, &mut FsRenameOps).unwrap();

        let outcome = recover(&fixture.layout).unwrap();
        assert!(matches!(outcome, RecoveryOutcome::CompletedForward { .. }));
        assert!(open_all_under(&fixture, &prepared.new_key));
        assert!(no_leftovers(&fixture.layout));
    }

    #[test]
    fn recover_on_clean_store_is_noop() {
        let fixture = seed_store();
        assert_eq!(recover(&fixture.layout).unwrap(), RecoveryOutcome::Clean);
        assert!(open_all_under(&fixture, &fixture.old_key));
    }
}
