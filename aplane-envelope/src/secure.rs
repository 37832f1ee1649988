//! SecureBuffer: owned secret bytes with a guaranteed wipe.
//!
//! The wipe goes through `zeroize`, whose writes are fenced against
//! the optimizer. The internal lock lets concurrent readers borrow the
//! contents while excluding a wipe during any borrow.

use std::sync::RwLock;

use zeroize::Zeroize;

/// An owned byte buffer that wipes its contents on `destroy` and on drop.
pub struct SecureBuffer {
    inner: RwLock<Vec<u8>>,
}

impl SecureBuffer {
    /// Copy `src` into owned storage. The caller may wipe its own copy
    /// immediately afterwards.
    pub fn new_from_bytes(src: &[u8]) -> Self {
        Self {
            inner: RwLock::new(src.to_vec()),
        }
    }

    /// An already-wiped buffer.
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    /// Invoke `f` with a read-only view of the contents.
    ///
    /// The view is valid only for the duration of the call; after
    /// `destroy` the callback sees an empty slice. Callers must not
    /// smuggle the slice out of the closure.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Wipe and clear. Safe to call more than once.
    pub fn destroy(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.zeroize();
        guard.clear();
        guard.shrink_to_fit();
    }

    /// True iff wiped or constructed from empty input.
    pub fn is_empty(&self) -> bool {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.is_empty()
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        if let Ok(guard) = self.inner.get_mut() {
            guard.zeroize();
        }
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBuffer({} bytes)", self.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_and_exposes_bytes() {
        let buf = SecureBuffer::new_from_bytes(b"secret");
        assert_eq!(buf.len(), 6);
        assert!(!buf.is_empty());
        buf.with_bytes(|b| assert_eq!(b, b"secret"));
    }

    #[test]
    fn destroy_is_idempotent_and_empties() {
        let buf = SecureBuffer::new_from_bytes(b"secret");
        buf.destroy();
        assert!(buf.is_empty());
        buf.with_bytes(|b| assert!(b.is_empty()));
        buf.destroy();
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_input_is_empty() {
        let buf = SecureBuffer::new_from_bytes(b"");
        assert!(buf.is_empty());
        let buf = SecureBuffer::empty();
        assert!(buf.is_empty());
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        use std::sync::Arc;

        let buf = Arc::new(SecureBuffer::new_from_bytes(b"shared"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let buf = buf.clone();
            handles.push(std::thread::spawn(move || {
                buf.with_bytes(|b| assert_eq!(b, b"shared"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
