//! Server certificates and SSH host keys presented to certificate-check
//! callbacks.

use std::{ops::BitOr, slice};

use libgit2_sys as raw;

use crate::utils::{HashAlgorithm, digest};

/// Which fields of a [`HostkeyCertificate`] are populated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HostkeyKind(u32);

impl HostkeyKind {
    pub const MD5: HostkeyKind = HostkeyKind(1 << 0);
    pub const SHA1: HostkeyKind = HostkeyKind(1 << 1);
    pub const SHA256: HostkeyKind = HostkeyKind(1 << 2);
    pub const RAW: HostkeyKind = HostkeyKind(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: HostkeyKind) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for HostkeyKind {
    type Output = HostkeyKind;

    fn bitor(self, rhs: Self) -> Self::Output {
        HostkeyKind(self.0 | rhs.0)
    }
}

/// SSH host key with its fingerprints.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HostkeyCertificate {
    pub kind: HostkeyKind,
    pub hash_md5: [u8; 16],
    pub hash_sha1: [u8; 20],
    pub hash_sha256: [u8; 32],
    /// Raw wire encoding of the key, when `kind` contains [`HostkeyKind::RAW`].
    pub hostkey: Vec<u8>,
}

impl HostkeyCertificate {
    /// Fingerprints a wire-encoded public key with every supported digest.
    pub fn from_key(key: &[u8]) -> Self {
        HostkeyCertificate {
            kind: HostkeyKind::MD5 | HostkeyKind::SHA1 | HostkeyKind::SHA256 | HostkeyKind::RAW,
            hash_md5: digest(HashAlgorithm::md5(), key),
            hash_sha1: digest(HashAlgorithm::sha1(), key),
            hash_sha256: digest(HashAlgorithm::sha256(), key),
            hostkey: key.to_vec(),
        }
    }
}

/// Certificate presented by a remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Certificate {
    /// DER-encoded TLS certificate.
    X509(Vec<u8>),
    Hostkey(HostkeyCertificate),
    /// A certificate type this binding does not decode.
    None,
}

impl Certificate {
    /// Copies a native certificate.
    ///
    /// # Safety
    ///
    /// `cert` must be null or point at a live `git_cert` whose concrete type
    /// matches its `cert_type` tag.
    pub(crate) unsafe fn from_raw(cert: *const raw::git_cert) -> Certificate {
        if cert.is_null() {
            return Certificate::None;
        }
        unsafe {
            let cert_type = (*cert).cert_type;
            if cert_type == raw::GIT_CERT_X509 {
                let x509 = cert as *const raw::git_cert_x509;
                let data = if (*x509).data.is_null() {
                    Vec::new()
                } else {
                    slice::from_raw_parts((*x509).data as *const u8, (*x509).len as usize).to_vec()
                };
                Certificate::X509(data)
            } else if cert_type == raw::GIT_CERT_HOSTKEY_LIBSSH2 {
                let h = cert as *const raw::git_cert_hostkey;
                let kind = HostkeyKind((*h).kind as u32);
                let hostkey = if kind.contains(HostkeyKind::RAW) && !(*h).hostkey.is_null() {
                    slice::from_raw_parts((*h).hostkey as *const u8, (*h).hostkey_len as usize)
                        .to_vec()
                } else {
                    Vec::new()
                };
                Certificate::Hostkey(HostkeyCertificate {
                    kind,
                    hash_md5: (*h).hash_md5,
                    hash_sha1: (*h).hash_sha1,
                    hash_sha256: (*h).hash_sha256,
                    hostkey,
                })
            } else {
                Certificate::None
            }
        }
    }

    pub fn as_hostkey(&self) -> Option<&HostkeyCertificate> {
        match self {
            Certificate::Hostkey(h) => Some(h),
            _ => None,
        }
    }
}
