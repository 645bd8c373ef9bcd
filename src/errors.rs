//! Error types for the git-bridge crate.
//!
//! This module defines a unified error enumeration used across the native
//! binding, the handle bridge, and the pluggable smart transports. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Notes:
//! - Native failures carry the libgit2 code, class and message.
//! - `User` is the sentinel for "a managed callback failed and its error has
//!   been stashed"; top-level calls replace it with the stashed error.

use std::ffi::CStr;

use libc::c_int;
use libgit2_sys as raw;
use thiserror::Error;

/// libgit2's `GIT_EUSER`.
pub(crate) const GIT_EUSER: c_int = -7;
/// libgit2's `GIT_PASSTHROUGH`.
pub(crate) const GIT_PASSTHROUGH: c_int = -30;
/// libgit2's `GIT_ECERTIFICATE`.
pub(crate) const GIT_ECERTIFICATE: c_int = -17;

#[derive(Error, Debug)]
/// Unified error enumeration for the git-bridge library.
///
/// - Used across native calls, subtransports, streams and managed callbacks.
/// - Implements `std::error::Error` via `thiserror`.
pub enum GitError {
    /// A native call failed; translated from libgit2's last error.
    #[error("{message} (code {code:?}, class {class:?})")]
    Native {
        code: ErrorCode,
        class: ErrorClass,
        message: String,
    },

    /// A managed callback failed and its error was stashed for the caller.
    #[error("a user callback returned an error")]
    User,

    /// No managed handler is available; the native default applies.
    #[error("no handler available, deferring to the native default")]
    Passthrough,

    /// Invalid argument passed across the binding.
    #[error("Argument parse failed: {0}")]
    InvalidArgument(String),

    /// Malformed or unsupported remote URL.
    #[error("The `{0}` is not a valid remote url.")]
    InvalidUrl(String),

    /// Smart service action the subtransport does not understand.
    #[error("Unsupported smart service action: {0}")]
    UnsupportedAction(String),

    /// Terminal HTTP status returned by the remote.
    #[error("Unhandled HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// HTTP client failure.
    #[error("HTTP Error: {0}")]
    Http(#[from] reqwest::Error),

    /// SSH dial, session or channel failure.
    #[error("SSH Error: {0}")]
    Ssh(String),

    /// SSH authentication was rejected by the server.
    #[error("SSH authentication failed for user `{0}`")]
    SshAuth(String),

    /// The credential handed back by a callback cannot be used here.
    #[error("Unsupported credential: {0}")]
    InvalidCredential(String),

    /// The remote's certificate or host key was rejected.
    #[error("Certificate rejected for host `{0}`")]
    CertificateRejected(String),

    /// The subtransport was used after it was freed.
    #[error("subtransport used after free")]
    SubtransportFreed,

    /// A blocking network call was made from a thread that drives a tokio
    /// runtime.
    #[error("blocking transport call made inside an async runtime")]
    AsyncContext,

    /// I/O error from an underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl From<russh::Error> for GitError {
    fn from(err: russh::Error) -> Self {
        GitError::Ssh(err.to_string())
    }
}

impl From<russh_keys::Error> for GitError {
    fn from(err: russh_keys::Error) -> Self {
        GitError::Ssh(err.to_string())
    }
}

/// libgit2 error codes, as returned by native calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    GenericError,
    NotFound,
    Exists,
    Ambiguous,
    BufSize,
    User,
    BareRepo,
    UnbornBranch,
    Auth,
    Certificate,
    Eof,
    Invalid,
    Passthrough,
    Timeout,
    Other(i32),
}

impl ErrorCode {
    pub fn from_raw(code: c_int) -> Self {
        match code {
            -1 => ErrorCode::GenericError,
            -3 => ErrorCode::NotFound,
            -4 => ErrorCode::Exists,
            -5 => ErrorCode::Ambiguous,
            -6 => ErrorCode::BufSize,
            GIT_EUSER => ErrorCode::User,
            -8 => ErrorCode::BareRepo,
            -9 => ErrorCode::UnbornBranch,
            -16 => ErrorCode::Auth,
            GIT_ECERTIFICATE => ErrorCode::Certificate,
            -31 => ErrorCode::Eof,
            -21 => ErrorCode::Invalid,
            GIT_PASSTHROUGH => ErrorCode::Passthrough,
            -37 => ErrorCode::Timeout,
            other => ErrorCode::Other(other),
        }
    }
}

/// libgit2 error classes (`git_error_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    NoMemory,
    Os,
    Invalid,
    Reference,
    Repository,
    Config,
    Net,
    Ssl,
    Ssh,
    Callback,
    Http,
    Other(i32),
}

impl ErrorClass {
    pub(crate) const NET: c_int = 12;
    pub(crate) const SSH: c_int = 23;
    pub(crate) const CALLBACK: c_int = 26;

    pub fn from_raw(class: c_int) -> Self {
        match class {
            0 => ErrorClass::None,
            1 => ErrorClass::NoMemory,
            2 => ErrorClass::Os,
            3 => ErrorClass::Invalid,
            4 => ErrorClass::Reference,
            6 => ErrorClass::Repository,
            7 => ErrorClass::Config,
            Self::NET => ErrorClass::Net,
            16 => ErrorClass::Ssl,
            Self::SSH => ErrorClass::Ssh,
            Self::CALLBACK => ErrorClass::Callback,
            34 => ErrorClass::Http,
            other => ErrorClass::Other(other),
        }
    }
}

impl GitError {
    /// Returns the native error code this error maps to when it has to be
    /// handed back across the boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            GitError::Native { code, .. } => *code,
            GitError::User => ErrorCode::User,
            GitError::Passthrough => ErrorCode::Passthrough,
            GitError::SshAuth(_) | GitError::InvalidCredential(_) => ErrorCode::Auth,
            GitError::CertificateRejected(_) => ErrorCode::Certificate,
            GitError::HttpStatus { status: 401, .. } => ErrorCode::Auth,
            _ => ErrorCode::GenericError,
        }
    }
}

/// Builds a [`GitError`] from the status of a failed native call and
/// libgit2's thread-local last error.
pub(crate) fn last_error(code: c_int) -> GitError {
    let (class, message) = unsafe {
        let err = raw::git_error_last();
        if err.is_null() || (*err).message.is_null() {
            (0, String::from("unknown native error"))
        } else {
            (
                (*err).klass,
                CStr::from_ptr((*err).message).to_string_lossy().into_owned(),
            )
        }
    };
    GitError::Native {
        code: ErrorCode::from_raw(code),
        class: ErrorClass::from_raw(class),
        message,
    }
}

/// Translates a native status into `Ok(())` or the matching [`GitError`].
pub(crate) fn check(code: c_int) -> Result<(), GitError> {
    if code < 0 { Err(last_error(code)) } else { Ok(()) }
}

/// Records `message` as libgit2's last error so the native caller can report
/// it, returning the generic failure status.
pub(crate) fn set_native_error(class: c_int, message: &str) -> c_int {
    let message = crate::utils::to_cstring_lossy(message);
    unsafe {
        raw::git_error_set_str(class, message.as_ptr());
    }
    -1
}
