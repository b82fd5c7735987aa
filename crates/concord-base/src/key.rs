use std::fmt;

use crate::error::{Error, Result};

/// Maximum length, in bytes, of a [`Key`].
pub const MAX_KEY_BYTES: usize = 1024;

/// Maximum number of entries accepted by any `*_many` batch operation.
pub const MAX_BATCH_SIZE: usize = 500;

/// A validated, non-empty byte string of at most [`MAX_KEY_BYTES`] bytes.
///
/// Ordering is lexicographic over the raw bytes, which is what the
/// `Store`'s ordered map relies on for scans.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Validate and wrap `bytes` as a `Key`.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_KEY_BYTES {
            return Err(Error::InvalidKey);
        }
        Ok(Key(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Key({s:?})"),
            Err(_) => write!(f, "Key({:?})", self.0),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:x?}", self.0),
        }
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        assert!(matches!(Key::new(Vec::new()), Err(Error::InvalidKey)));
    }

    #[test]
    fn accepts_boundary_length() {
        assert!(Key::new(vec![b'a'; MAX_KEY_BYTES]).is_ok());
        assert!(matches!(
            Key::new(vec![b'a'; MAX_KEY_BYTES + 1]),
            Err(Error::InvalidKey)
        ));
    }

    #[test]
    fn orders_lexicographically() {
        let a = Key::new(b"a".to_vec()).unwrap();
        let b = Key::new(b"b".to_vec()).unwrap();
        assert!(a < b);
    }
}
