//! Object identifiers as they cross the native boundary.
//!
//! libgit2 reports object ids as raw 20-byte `git_oid` values; [`ObjectHash`]
//! is the managed copy handed to callers (remote heads, tip updates).

use std::{fmt::Display, str::FromStr};

use libgit2_sys as raw;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// Size in bytes of a SHA-1 object id.
pub const SHA1_SIZE: usize = 20;

/// A 20-byte Git object id, printed as 40 lowercase hex characters.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct ObjectHash([u8; SHA1_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parses a 40-character hexadecimal id.
impl FromStr for ObjectHash {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SHA1_SIZE * 2 {
            return Err(GitError::InvalidArgument(format!(
                "invalid object id length {}: `{s}`",
                s.len()
            )));
        }
        let mut h = [0u8; SHA1_SIZE];
        hex::decode_to_slice(s, &mut h)
            .map_err(|e| GitError::InvalidArgument(format!("invalid object id `{s}`: {e}")))?;
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    /// The all-zero id, used by the protocol for "no object".
    pub const fn zero() -> Self {
        ObjectHash([0u8; SHA1_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Create ObjectHash from a byte slice
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, GitError> {
        let h: [u8; SHA1_SIZE] = bytes.try_into().map_err(|_| {
            GitError::InvalidArgument(format!(
                "Invalid byte length: got {}, expected {SHA1_SIZE}",
                bytes.len()
            ))
        })?;
        Ok(ObjectHash(h))
    }

    /// Export the id to a byte array
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub(crate) fn from_raw(oid: &raw::git_oid) -> Self {
        ObjectHash(oid.id)
    }

    /// Copies a native id; a null pointer maps to the zero id.
    ///
    /// # Safety
    ///
    /// `oid` must be null or valid for reads.
    pub(crate) unsafe fn from_raw_ptr(oid: *const raw::git_oid) -> Self {
        if oid.is_null() {
            ObjectHash::zero()
        } else {
            ObjectHash::from_raw(unsafe { &*oid })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::ObjectHash;

    #[test]
    fn test_sha1_from_str() {
        let hash_str = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        let hash = ObjectHash::from_str(hash_str).unwrap();
        assert_eq!(hash.to_string(), hash_str);
        assert!(!hash.is_zero());
    }

    #[test]
    fn test_invalid_length_is_rejected() {
        assert!(ObjectHash::from_str("8ab686").is_err());
        assert!(ObjectHash::from_bytes(&[1, 2, 3]).is_err());
        assert!(ObjectHash::from_str(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn test_zero_id() {
        let zero = ObjectHash::zero();
        assert!(zero.is_zero());
        assert_eq!(zero.to_string(), "0".repeat(40));
        assert_eq!(zero, ObjectHash::default());
        assert_eq!(unsafe { ObjectHash::from_raw_ptr(std::ptr::null()) }, zero);
    }

    #[test]
    fn test_to_data() {
        let bytes: Vec<u8> = (0u8..20).collect();
        let hash = ObjectHash::from_bytes(&bytes).unwrap();
        assert_eq!(hash.to_data(), bytes);
        assert_eq!(hash.as_ref(), bytes.as_slice());
    }
}
