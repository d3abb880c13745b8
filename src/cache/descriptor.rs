//! Cache Descriptors
//!
//! A descriptor is the string key of one cached blob. Its bucket decides
//! which shard file indexes it, in every data file, so the hash below is
//! part of the on-disk format and must never change.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Immutable string key of a cached blob
///
/// Cheap to clone. Ordering is the natural string ordering, which is also
/// the order entries are written to shard files.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(Arc<str>);

impl Descriptor {
    /// Create a descriptor, rejecting strings with embedded NUL bytes
    pub fn new(descriptor: impl AsRef<str>) -> Result<Self> {
        let descriptor = descriptor.as_ref();
        if descriptor.as_bytes().contains(&0) {
            return Err(Error::InvalidDescriptor(descriptor.to_string()));
        }
        Ok(Self(Arc::from(descriptor)))
    }

    /// Get the descriptor text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the descriptor bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the descriptor is the empty string
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rolling hash of the descriptor bytes
    #[inline]
    pub fn hash_value(&self) -> u32 {
        descriptor_hash(self.as_bytes())
    }

    /// Shard bucket (0..nbr_hash) of this descriptor
    #[inline]
    pub fn bucket(&self, nbr_hash: usize) -> usize {
        bucket_of(self.as_bytes(), nbr_hash)
    }
}

/// Rotate-and-xor hash over `bytes`
#[inline]
pub fn descriptor_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |hash, &byte| hash.rotate_left(5) ^ u32::from(byte))
}

/// Bucket of `bytes` for a cache with `nbr_hash` shards per file
#[inline]
pub fn bucket_of(bytes: &[u8], nbr_hash: usize) -> usize {
    descriptor_hash(bytes) as usize % nbr_hash.max(1)
}

impl TryFrom<&str> for Descriptor {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for Descriptor {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl AsRef<str> for Descriptor {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for Descriptor {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nul_rejected() {
        assert!(Descriptor::new("tile\0x").is_err());
        assert!(Descriptor::try_from("tile").is_ok());
    }

    #[test]
    fn test_hash_known_values() {
        // These values pin the on-disk shard layout.
        assert_eq!(descriptor_hash(b""), 0);
        assert_eq!(descriptor_hash(b"a"), 0x61);
        assert_eq!(descriptor_hash(b"ab"), (0x61u32 << 5) ^ 0x62);
        assert_eq!(descriptor_hash(b"abc"), (((0x61u32 << 5) ^ 0x62) << 5) ^ 0x63);
    }

    #[test]
    fn test_hash_wraps_around() {
        // Seven rotations by five bits carry the first byte past bit 31.
        let hash = descriptor_hash(&[0xff, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(hash, 0xffu32.rotate_left(35 % 32));
    }

    #[test]
    fn test_bucket_matches_free_function() {
        let desc = Descriptor::new("T_3_17_4711").unwrap();
        assert_eq!(desc.bucket(23), bucket_of(b"T_3_17_4711", 23));
        assert_eq!(desc.bucket(1), 0);
    }

    #[test]
    fn test_ordering_is_string_ordering() {
        let a = Descriptor::new("a").unwrap();
        let b = Descriptor::new("b").unwrap();
        let aa = Descriptor::new("aa").unwrap();
        assert!(a < aa);
        assert!(aa < b);
    }

    proptest! {
        #[test]
        fn prop_bucket_in_range_and_stable(s in "[a-zA-Z0-9_:.-]{0,64}", nbr_hash in 1usize..64) {
            let first = Descriptor::new(&s).unwrap();
            let second = Descriptor::new(s.clone()).unwrap();
            let bucket = first.bucket(nbr_hash);
            prop_assert!(bucket < nbr_hash);
            prop_assert_eq!(bucket, second.bucket(nbr_hash));
        }
    }
}
