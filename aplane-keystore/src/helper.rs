//! Passphrase helper: an optional external command that bridges the
//! store to a secrets backend.
//!
//! The helper is invoked with a verb, appended as its final argument
//! and exported as `APLANE_HELPER_VERB`:
//!   - `read`: print the current passphrase on stdout.
//!   - `write`: store a new passphrase supplied on stdin.
//! A non-zero exit signals failure.

use std::io::Write;
use std::process::{Command, Stdio};

use zeroize::Zeroize;

use aplane_envelope::SecureBuffer;

use crate::error::KeystoreError;

pub const HELPER_VERB_ENV: &str = "APLANE_HELPER_VERB";

#[derive(Clone, Debug)]
pub struct PassphraseHelper {
    argv: Vec<String>,
}

impl PassphraseHelper {
    /// `None` when the argv vector is empty (helper not configured).
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() || argv[0].is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    fn command(&self, verb: &str) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).arg(verb).env(HELPER_VERB_ENV, verb);
        cmd
    }

    /// Fetch the current passphrase. Trailing newlines are stripped;
    /// the captured stdout is wiped after the copy.
    pub fn read(&self) -> Result<SecureBuffer, KeystoreError> {
        let output = self
            .command("read")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| KeystoreError::HelperReadFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(KeystoreError::HelperReadFailed(format!(
                "exit status {}",
                output.status
            )));
        }

        let mut stdout = output.stdout;
        let mut end = stdout.len();
        while end > 0 && (stdout[end - 1] == b'\n' || stdout[end - 1] == b'\r') {
            end -= 1;
        }
        let buf = SecureBuffer::new_from_bytes(&stdout[..end]);
        stdout.zeroize();
        Ok(buf)
    }

    /// Hand the helper a new passphrase on stdin.
    pub fn write(&self, passphrase: &[u8]) -> Result<(), KeystoreError> {
        let mut child = self
            .command("write")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| KeystoreError::HelperWriteFailed(e.to_string()))?;

        if let Some(stdin) = child.stdin.take() {
            let mut stdin = stdin;
            stdin
                .write_all(passphrase)
                .and_then(|_| stdin.flush())
                .map_err(|e| KeystoreError::HelperWriteFailed(e.to_string()))?;
        }

        let status = child
            .wait()
            .map_err(|e| KeystoreError::HelperWriteFailed(e.to_string()))?;
        if !status.success() {
            return Err(KeystoreError::HelperWriteFailed(format!(
                "exit status {}",
                status
            )));
        }
        Ok(())
    }
}
