//! Remotes and the managed state native callbacks resolve them to.
//!
//! A [`Remote`] owns a native `git_remote` plus a shared [`RemoteInfo`]. The
//! info is tracked in the handle table (its handle is the payload of every
//! native remote callback) and registered by native address so transport
//! factories can find it. Both registrations end when the `Remote` drops.

pub mod callbacks;
pub mod registry;

use std::{
    marker::PhantomData,
    ptr, slice,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use libc::{c_char, c_int};
use libgit2_sys as raw;

use crate::{
    bridge::{Bridge, Tracked},
    cert::Certificate,
    credentials::{Credential, CredentialType},
    errors::{GitError, check, last_error},
    handles::Handle,
    hash::ObjectHash,
    repository::Repository,
    transport::types::Direction,
    utils::{from_cstr, to_cstring, to_opt_cstring},
};

pub use callbacks::{
    PackbuilderStage, RemoteCallbacks, RemoteCompletion, TransferProgress,
};
pub use registry::RemoteRegistry;

// libgit2-sys exports no version constants for these option structs.
const FETCH_OPTIONS_VERSION: libc::c_uint = 1;
const PUSH_OPTIONS_VERSION: libc::c_uint = 1;

/// Managed state shared between a [`Remote`], its callback trampolines and
/// the subtransports created for it.
pub struct RemoteInfo {
    name: Option<String>,
    url: String,
    callbacks: Mutex<RemoteCallbacks>,
    error: Mutex<Option<GitError>>,
}

impl RemoteInfo {
    pub(crate) fn new(name: Option<String>, url: String) -> Self {
        RemoteInfo {
            name,
            url,
            callbacks: Mutex::new(RemoteCallbacks::default()),
            error: Mutex::new(None),
        }
    }

    /// Name of the remote; `None` for anonymous remotes.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Installs the callbacks for the next top-level operation and clears any
    /// error left by the previous one.
    pub(crate) fn install(&self, callbacks: RemoteCallbacks) {
        *self.lock_callbacks() = callbacks;
        self.take_error();
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, RemoteCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_callbacks<R>(&self, f: impl FnOnce(&mut RemoteCallbacks) -> R) -> R {
        f(&mut self.lock_callbacks())
    }

    /// Keeps `err` for the current top-level call. The first error wins.
    pub(crate) fn stash_error(&self, err: GitError) {
        if matches!(err, GitError::User) {
            return;
        }
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            None => {
                tracing::debug!(remote = %self.url, error = %err, "stashed callback error");
                *slot = Some(err);
            }
            Some(first) => {
                tracing::warn!(remote = %self.url, error = %err, first = %first, "dropping secondary error");
            }
        }
    }

    pub(crate) fn take_error(&self) -> Option<GitError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Resolves the status of a native top-level call: a stashed managed
    /// error takes precedence over the native error.
    pub(crate) fn finish(&self, rc: c_int) -> Result<(), GitError> {
        let stashed = self.take_error();
        if rc < 0 {
            return Err(stashed.unwrap_or_else(|| last_error(rc)));
        }
        if let Some(err) = stashed {
            tracing::warn!(remote = %self.url, error = %err, "discarding error from a call that succeeded");
        }
        Ok(())
    }

    /// Asks the credentials callback for authentication material.
    ///
    /// Fails with [`GitError::Passthrough`] when no callback is installed or
    /// the callback defers, and with [`GitError::User`] after stashing the
    /// callback's own error.
    pub(crate) fn credentials(
        &self,
        url: &str,
        username: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Credential, GitError> {
        let outcome = self.with_callbacks(|cbs| {
            cbs.credentials
                .as_mut()
                .map(|cb| cb(url, username, allowed))
        });
        match outcome {
            None | Some(Err(GitError::Passthrough)) => Err(GitError::Passthrough),
            Some(Ok(credential)) => Ok(credential),
            Some(Err(err)) => {
                self.stash_error(err);
                Err(GitError::User)
            }
        }
    }

    /// Runs the certificate-check callback. Without one, only certificates
    /// that already passed native validation are accepted.
    pub(crate) fn certificate_check(
        &self,
        cert: &Certificate,
        valid: bool,
        host: &str,
    ) -> Result<(), GitError> {
        let outcome = self.with_callbacks(|cbs| {
            cbs.certificate_check
                .as_mut()
                .map(|cb| cb(cert, valid, host))
        });
        match outcome {
            None | Some(Err(GitError::Passthrough)) => {
                if valid {
                    Ok(())
                } else {
                    Err(GitError::CertificateRejected(host.to_string()))
                }
            }
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                self.stash_error(err);
                Err(GitError::User)
            }
        }
    }
}

/// A reference advertised by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHead {
    pub name: String,
    pub oid: ObjectHash,
    /// Local id of the same reference, zero if unknown.
    pub loid: ObjectHash,
    pub local: bool,
    pub symref_target: Option<String>,
}

/// A native remote bound to a managed callback context.
pub struct Remote<'repo> {
    raw: *mut raw::git_remote,
    info: Arc<RemoteInfo>,
    handle: Handle,
    _marker: PhantomData<&'repo Repository>,
}

impl<'repo> Remote<'repo> {
    /// Takes ownership of a freshly created native remote.
    pub(crate) unsafe fn from_raw(remote: *mut raw::git_remote) -> Remote<'repo> {
        let (name, url) = unsafe {
            (
                from_cstr(raw::git_remote_name(remote)),
                from_cstr(raw::git_remote_url(remote)).unwrap_or_default(),
            )
        };
        let info = Arc::new(RemoteInfo::new(name, url));
        let bridge = Bridge::global();
        let handle = bridge.handles().track(Tracked::Remote(info.clone()));
        bridge.remotes().insert(remote, info.clone());
        tracing::debug!(remote = %info.url, %handle, "bound remote");
        Remote {
            raw: remote,
            info,
            handle,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.info.name()
    }

    pub fn url(&self) -> &str {
        self.info.url()
    }

    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.info
    }

    fn prepare(&self, callbacks: RemoteCallbacks) -> Result<raw::git_remote_callbacks, GitError> {
        self.info.install(callbacks);
        callbacks::native_callbacks(self.handle)
    }

    /// Opens a connection in `direction`, running `callbacks` for the
    /// duration of the call.
    pub fn connect(
        &mut self,
        direction: Direction,
        callbacks: RemoteCallbacks,
    ) -> Result<(), GitError> {
        let cbs = self.prepare(callbacks)?;
        let rc = unsafe {
            raw::git_remote_connect(self.raw, direction.raw(), &cbs, ptr::null(), ptr::null())
        };
        self.info.finish(rc)
    }

    pub fn connect_fetch(&mut self, callbacks: RemoteCallbacks) -> Result<(), GitError> {
        self.connect(Direction::Fetch, callbacks)
    }

    pub fn connect_push(&mut self, callbacks: RemoteCallbacks) -> Result<(), GitError> {
        self.connect(Direction::Push, callbacks)
    }

    pub fn connected(&self) -> bool {
        unsafe { raw::git_remote_connected(self.raw) == 1 }
    }

    /// References advertised by the connected remote, in advertisement order.
    pub fn ls(&self) -> Result<Vec<RemoteHead>, GitError> {
        let mut heads: *mut *const raw::git_remote_head = ptr::null_mut();
        let mut len = 0;
        check(unsafe { raw::git_remote_ls(&mut heads, &mut len, self.raw) })?;
        if heads.is_null() || len == 0 {
            return Ok(Vec::new());
        }
        let heads = unsafe { slice::from_raw_parts(heads, len as usize) };
        Ok(heads
            .iter()
            .filter(|head| !head.is_null())
            .map(|head| unsafe {
                let head = &**head;
                RemoteHead {
                    name: from_cstr(head.name).unwrap_or_default(),
                    oid: ObjectHash::from_raw(&head.oid),
                    loid: ObjectHash::from_raw(&head.loid),
                    local: head.local != 0,
                    symref_target: from_cstr(head.symref_target),
                }
            })
            .collect())
    }

    /// Downloads and updates references per `refspecs`; an empty list uses
    /// the configured ones.
    pub fn fetch(
        &mut self,
        refspecs: &[&str],
        callbacks: RemoteCallbacks,
        reflog_message: Option<&str>,
    ) -> Result<(), GitError> {
        let specs = StrArray::new(refspecs)?;
        let reflog = to_opt_cstring(reflog_message)?;
        let mut opts: raw::git_fetch_options = unsafe { std::mem::zeroed() };
        check(unsafe { raw::git_fetch_init_options(&mut opts, FETCH_OPTIONS_VERSION) })?;
        opts.callbacks = self.prepare(callbacks)?;
        let rc = unsafe {
            raw::git_remote_fetch(
                self.raw,
                &specs.raw(),
                &opts,
                reflog.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            )
        };
        self.info.finish(rc)
    }

    pub fn push(&mut self, refspecs: &[&str], callbacks: RemoteCallbacks) -> Result<(), GitError> {
        let specs = StrArray::new(refspecs)?;
        // No init function is bound for push options; every nested struct
        // needs its version set or libgit2 rejects the call.
        let mut opts: raw::git_push_options = unsafe { std::mem::zeroed() };
        opts.version = PUSH_OPTIONS_VERSION;
        opts.pb_parallelism = 1;
        opts.proxy_opts.version = raw::GIT_PROXY_OPTIONS_VERSION;
        opts.proxy_opts.kind = raw::GIT_PROXY_NONE;
        opts.callbacks = self.prepare(callbacks)?;
        let rc = unsafe { raw::git_remote_push(self.raw, &specs.raw(), &opts) };
        self.info.finish(rc)
    }

    pub fn disconnect(&mut self) -> Result<(), GitError> {
        check(unsafe { raw::git_remote_disconnect(self.raw) })
    }
}

impl Drop for Remote<'_> {
    fn drop(&mut self) {
        // The address may be reused as soon as it is freed, so the registry
        // entry goes first. The transport keeps its own `Arc<RemoteInfo>`.
        let bridge = Bridge::global();
        bridge.remotes().remove(self.raw);
        unsafe { raw::git_remote_free(self.raw) };
        bridge.handles().untrack(self.handle);
        tracing::debug!(remote = %self.info.url, handle = %self.handle, "released remote");
    }
}

/// Owned `git_strarray` input.
struct StrArray {
    _strings: Vec<std::ffi::CString>,
    ptrs: Vec<*mut c_char>,
}

impl StrArray {
    fn new(items: &[&str]) -> Result<Self, GitError> {
        let strings = items
            .iter()
            .map(|s| to_cstring(s))
            .collect::<Result<Vec<_>, _>>()?;
        let ptrs = strings.iter().map(|s| s.as_ptr() as *mut c_char).collect();
        Ok(StrArray {
            _strings: strings,
            ptrs,
        })
    }

    fn raw(&self) -> raw::git_strarray {
        raw::git_strarray {
            strings: self.ptrs.as_ptr() as *mut *mut c_char,
            count: self.ptrs.len() as _,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> RemoteInfo {
        RemoteInfo::new(Some("origin".into()), "foo://bar".into())
    }

    /// Without a handler, only natively validated certificates pass.
    #[test]
    fn certificate_check_defaults_to_native_verdict() {
        let info = info();
        let cert = Certificate::X509(vec![1, 2, 3]);
        assert!(info.certificate_check(&cert, true, "bar").is_ok());
        assert!(matches!(
            info.certificate_check(&cert, false, "bar"),
            Err(GitError::CertificateRejected(host)) if host == "bar"
        ));
    }

    #[test]
    fn credentials_without_handler_pass_through() {
        let info = info();
        assert!(matches!(
            info.credentials("foo://bar", None, CredentialType::USERPASS_PLAINTEXT),
            Err(GitError::Passthrough)
        ));
    }

    /// The first stashed error is the one surfaced to the caller.
    #[test]
    fn first_stashed_error_wins() {
        let info = info();
        info.install(
            RemoteCallbacks::new()
                .certificate_check(|_, _, host| Err(GitError::CustomError(format!("reject {host}")))),
        );
        let cert = Certificate::None;
        assert!(matches!(
            info.certificate_check(&cert, true, "first"),
            Err(GitError::User)
        ));
        info.stash_error(GitError::CustomError("second".into()));
        match info.finish(-7) {
            Err(GitError::CustomError(msg)) => assert_eq!(msg, "reject first"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(info.take_error().is_none());
    }

    /// Dropping a remote releases its registry entry and handle.
    #[test]
    fn drop_releases_managed_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let remote = repo.remote_anonymous("foo://bar").unwrap();
        let key = remote.raw;
        let info = remote.info().clone();
        assert!(Bridge::global().remotes().get(key).is_some());

        drop(remote);
        let entry = Bridge::global().remotes().get(key);
        assert!(entry.is_none_or(|other| !Arc::ptr_eq(&other, &info)));
        assert_eq!(Arc::strong_count(&info), 1);
    }

    #[test]
    fn install_clears_previous_error() {
        let info = info();
        info.stash_error(GitError::CustomError("stale".into()));
        info.install(RemoteCallbacks::new());
        assert!(info.finish(0).is_ok());
    }
}
