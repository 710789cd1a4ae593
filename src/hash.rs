//! Node digest type using RIPEMD-160

use ripemd::{Digest, Ripemd160};
use std::fmt;

/// Number of bytes in a node digest
pub const HASH_SIZE: usize = 20;

/// A 20-byte RIPEMD-160 digest identifying a tree node
///
/// The digest doubles as the node's key in the external store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Create a hash from raw bytes
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Create a hash from a byte slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    /// Hash arbitrary data
    pub fn digest(data: &[u8]) -> Self {
        let digest = Ripemd160::digest(data);
        Hash(digest.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Get a short prefix for display (first 8 hex chars)
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        let h1 = Hash::digest(b"hello");
        let h2 = Hash::digest(b"hello");
        let h3 = Hash::digest(b"world");

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_known_vector() {
        // RIPEMD-160("abc")
        let h = Hash::digest(b"abc");
        assert_eq!(
            h.to_hex(),
            "8EB208F7E05D987A9B044A8E98C6B087F15A0BFC"
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let h1 = Hash::digest(b"test data");
        let hex = h1.to_hex();
        let h2 = Hash::from_hex(&hex).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Hash::from_slice(&[0u8; HASH_SIZE]).is_some());
        assert!(Hash::from_slice(&[0u8; 19]).is_none());
        assert!(Hash::from_slice(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_short() {
        let h = Hash::digest(b"test");
        assert_eq!(h.short().len(), 8);
    }
}
