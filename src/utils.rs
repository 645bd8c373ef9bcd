//! Shared helpers for crossing the native boundary: C string conversion in both
//! directions and the digest abstraction used to fingerprint host keys.

use std::ffi::{CStr, CString};

use libc::c_char;
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::errors::GitError;

/// Converts `s` to a C string, dropping interior NUL bytes instead of failing.
/// Only used for diagnostics where losing a NUL is harmless.
pub fn to_cstring_lossy(s: &str) -> CString {
    let bytes: Vec<u8> = s.bytes().filter(|b| *b != 0).collect();
    // No NULs are left, so construction cannot fail.
    CString::new(bytes).unwrap_or_default()
}

/// Converts `s` to a C string, rejecting interior NUL bytes.
pub fn to_cstring(s: &str) -> Result<CString, GitError> {
    CString::new(s).map_err(|_| GitError::InvalidArgument(format!("`{s}` contains a NUL byte")))
}

/// Optional variant of [`to_cstring`] for nullable native arguments.
pub fn to_opt_cstring(s: Option<&str>) -> Result<Option<CString>, GitError> {
    s.map(to_cstring).transpose()
}

/// Copies a native string. A null pointer yields `None`.
///
/// # Safety
///
/// `ptr` must be null or point at a NUL-terminated string valid for the call.
pub unsafe fn from_cstr(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

/// Digest abstraction over the algorithms used for host-key fingerprints.
#[derive(Clone)]
pub enum HashAlgorithm {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(sha2::Sha256),
}

impl HashAlgorithm {
    pub fn md5() -> Self {
        HashAlgorithm::Md5(Md5::new())
    }

    pub fn sha1() -> Self {
        HashAlgorithm::Sha1(Sha1::new())
    }

    pub fn sha256() -> Self {
        HashAlgorithm::Sha256(sha2::Sha256::new())
    }

    /// Update hash with data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashAlgorithm::Md5(hasher) => hasher.update(data),
            HashAlgorithm::Sha1(hasher) => hasher.update(data),
            HashAlgorithm::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finalize and get hash result
    pub fn finalize(self) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5(hasher) => hasher.finalize().to_vec(),
            HashAlgorithm::Sha1(hasher) => hasher.finalize().to_vec(),
            HashAlgorithm::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
}

/// Digests `data` in one go into a fixed-size array.
pub fn digest<const N: usize>(algorithm: HashAlgorithm, data: &[u8]) -> [u8; N] {
    let mut hasher = algorithm;
    hasher.update(data);
    let mut out = [0u8; N];
    let digest = hasher.finalize();
    let len = digest.len().min(N);
    out[..len].copy_from_slice(&digest[..len]);
    out
}
