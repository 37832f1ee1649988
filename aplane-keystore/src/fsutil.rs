//! Filesystem helpers: group-administrable directories, private files,
//! and atomic writes.
//!
//! Directories are 0770 with the setgid bit so group members can
//! administer the store; if setgid cannot be applied the directory is
//! left at 0770. Key and template records are 0660; the metadata file
//! and exported secrets are 0600.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub const DIR_MODE: u32 = 0o770;
pub const DIR_MODE_SETGID: u32 = 0o2770;
pub const FILE_MODE_GROUP: u32 = 0o660;
pub const FILE_MODE_PRIVATE: u32 = 0o600;

/// Create `path` (and parents) as a group-administrable directory.
pub fn ensure_group_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Setgid is best effort: some filesystems refuse it.
        if fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE_SETGID)).is_err() {
            fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))?;
        }
    }
    Ok(())
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename, with `mode` applied before the rename.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_group_dir(parent)?;
    }

    let tmp = tmp_sibling(path);
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    set_mode(&tmp, mode);
    fs::rename(&tmp, path)?;
    set_mode(path, mode);
    Ok(())
}

/// Best-effort chmod; no-op off unix.
pub fn set_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        atomic_write(&path, b"one", FILE_MODE_GROUP).unwrap();
        atomic_write(&path, b"two", FILE_MODE_GROUP).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // No temp file left behind.
        assert!(!path.with_file_name("f.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn private_mode_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        atomic_write(&path, b"s", FILE_MODE_PRIVATE).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_MODE_PRIVATE);
    }
}
