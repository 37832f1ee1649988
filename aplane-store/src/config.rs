//! CLI configuration: the optional `aplane.toml` inside the data
//! directory names the store subdirectory, the identity, and the
//! passphrase-helper command.

use std::path::Path;

use serde::Deserialize;

pub const CONFIG_FILE: &str = "aplane.toml";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Store subdirectory under the data directory.
    pub store_dir: String,
    /// Identity owning the keys and templates.
    pub identity: String,
    /// External passphrase-helper argv; empty means not configured.
    pub passphrase_helper: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: "keystore".into(),
            identity: "default".into(),
            passphrase_helper: Vec::new(),
        }
    }
}

impl Config {
    /// Read `<data_dir>/aplane.toml`, falling back to defaults when the
    /// file is absent.
    pub fn load(data_dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let path = data_dir.join(CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(format!("read {}: {}", path.display(), e).into()),
        };
        toml::from_str(&text).map_err(|e| format!("parse {}: {}", path.display(), e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.store_dir, "keystore");
        assert_eq!(config.identity, "default");
        assert!(config.passphrase_helper.is_empty());
    }

    #[test]
    fn config_file_overrides_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
store_dir = "signer-store"
identity = "ops"
passphrase_helper = ["pass", "show", "aplane"]
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.store_dir, "signer-store");
        assert_eq!(config.identity, "ops");
        assert_eq!(config.passphrase_helper, vec!["pass", "show", "aplane"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "store_dri = \"typo\"\n").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
