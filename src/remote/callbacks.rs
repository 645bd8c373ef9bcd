//! Managed remote callbacks and the native trampolines that dispatch to them.
//!
//! Every trampoline receives the owning remote's [`Handle`] as its payload.
//! An unset callback defers to libgit2 (`GIT_PASSTHROUGH` for credentials and
//! certificate checks, success otherwise). A callback error is stashed on the
//! remote and `GIT_EUSER` is returned so the top-level call can surface the
//! original error.

use std::{ffi::c_void, fmt, mem, slice, sync::Arc};

use libc::{c_char, c_int, c_uint, size_t};
use libgit2_sys as raw;

use crate::{
    bridge::Bridge,
    cert::Certificate,
    credentials::{Credential, CredentialType},
    errors::{GIT_EUSER, GIT_PASSTHROUGH, GitError},
    handles::Handle,
    hash::ObjectHash,
    remote::RemoteInfo,
    utils::from_cstr,
};

pub type CredentialsCallback =
    Box<dyn FnMut(&str, Option<&str>, CredentialType) -> Result<Credential, GitError> + Send>;
pub type CertificateCheckCallback =
    Box<dyn FnMut(&Certificate, bool, &str) -> Result<(), GitError> + Send>;
pub type SidebandProgressCallback = Box<dyn FnMut(&str) -> Result<(), GitError> + Send>;
pub type TransferProgressCallback =
    Box<dyn FnMut(&TransferProgress) -> Result<(), GitError> + Send>;
pub type CompletionCallback = Box<dyn FnMut(RemoteCompletion) -> Result<(), GitError> + Send>;
pub type UpdateTipsCallback =
    Box<dyn FnMut(&str, ObjectHash, ObjectHash) -> Result<(), GitError> + Send>;
pub type PackProgressCallback =
    Box<dyn FnMut(PackbuilderStage, u32, u32) -> Result<(), GitError> + Send>;
pub type PushTransferProgressCallback =
    Box<dyn FnMut(u32, u32, usize) -> Result<(), GitError> + Send>;
pub type PushUpdateReferenceCallback =
    Box<dyn FnMut(&str, Option<&str>) -> Result<(), GitError> + Send>;

/// Indexer statistics reported while a pack is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    pub total_objects: u32,
    pub indexed_objects: u32,
    pub received_objects: u32,
    pub local_objects: u32,
    pub total_deltas: u32,
    pub indexed_deltas: u32,
    pub received_bytes: usize,
}

impl TransferProgress {
    fn from_raw(stats: &raw::git_indexer_progress) -> Self {
        TransferProgress {
            total_objects: stats.total_objects as u32,
            indexed_objects: stats.indexed_objects as u32,
            received_objects: stats.received_objects as u32,
            local_objects: stats.local_objects as u32,
            total_deltas: stats.total_deltas as u32,
            indexed_deltas: stats.indexed_deltas as u32,
            received_bytes: stats.received_bytes as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCompletion {
    Download,
    Indexing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackbuilderStage {
    AddingObjects,
    Deltafication,
}

/// Optional handlers invoked during connect, fetch and push.
#[derive(Default)]
pub struct RemoteCallbacks {
    pub(crate) credentials: Option<CredentialsCallback>,
    pub(crate) certificate_check: Option<CertificateCheckCallback>,
    pub(crate) sideband_progress: Option<SidebandProgressCallback>,
    pub(crate) transfer_progress: Option<TransferProgressCallback>,
    pub(crate) completion: Option<CompletionCallback>,
    pub(crate) update_tips: Option<UpdateTipsCallback>,
    pub(crate) pack_progress: Option<PackProgressCallback>,
    pub(crate) push_transfer_progress: Option<PushTransferProgressCallback>,
    pub(crate) push_update_reference: Option<PushUpdateReferenceCallback>,
}

impl RemoteCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies credentials for `(url, username_from_url, allowed_kinds)`.
    /// Returning [`GitError::Passthrough`] defers to the next mechanism.
    pub fn credentials<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&str, Option<&str>, CredentialType) -> Result<Credential, GitError> + Send + 'static,
    {
        self.credentials = Some(Box::new(cb));
        self
    }

    /// Approves or rejects a certificate; the flag says whether it already
    /// passed native validation.
    pub fn certificate_check<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&Certificate, bool, &str) -> Result<(), GitError> + Send + 'static,
    {
        self.certificate_check = Some(Box::new(cb));
        self
    }

    pub fn sideband_progress<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&str) -> Result<(), GitError> + Send + 'static,
    {
        self.sideband_progress = Some(Box::new(cb));
        self
    }

    pub fn transfer_progress<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&TransferProgress) -> Result<(), GitError> + Send + 'static,
    {
        self.transfer_progress = Some(Box::new(cb));
        self
    }

    pub fn completion<F>(mut self, cb: F) -> Self
    where
        F: FnMut(RemoteCompletion) -> Result<(), GitError> + Send + 'static,
    {
        self.completion = Some(Box::new(cb));
        self
    }

    /// Called with `(refname, old, new)` for every updated reference.
    pub fn update_tips<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&str, ObjectHash, ObjectHash) -> Result<(), GitError> + Send + 'static,
    {
        self.update_tips = Some(Box::new(cb));
        self
    }

    pub fn pack_progress<F>(mut self, cb: F) -> Self
    where
        F: FnMut(PackbuilderStage, u32, u32) -> Result<(), GitError> + Send + 'static,
    {
        self.pack_progress = Some(Box::new(cb));
        self
    }

    /// Called with `(current, total, bytes)` while a pack is pushed.
    pub fn push_transfer_progress<F>(mut self, cb: F) -> Self
    where
        F: FnMut(u32, u32, usize) -> Result<(), GitError> + Send + 'static,
    {
        self.push_transfer_progress = Some(Box::new(cb));
        self
    }

    /// Called per pushed reference; the status is `None` when the remote
    /// accepted the update.
    pub fn push_update_reference<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&str, Option<&str>) -> Result<(), GitError> + Send + 'static,
    {
        self.push_update_reference = Some(Box::new(cb));
        self
    }
}

impl fmt::Debug for RemoteCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCallbacks")
            .field("credentials", &self.credentials.is_some())
            .field("certificate_check", &self.certificate_check.is_some())
            .field("sideband_progress", &self.sideband_progress.is_some())
            .field("transfer_progress", &self.transfer_progress.is_some())
            .field("completion", &self.completion.is_some())
            .field("update_tips", &self.update_tips.is_some())
            .field("pack_progress", &self.pack_progress.is_some())
            .field("push_transfer_progress", &self.push_transfer_progress.is_some())
            .field("push_update_reference", &self.push_update_reference.is_some())
            .finish()
    }
}

/// Native callback table whose payload is the remote's handle.
pub(crate) fn native_callbacks(payload: Handle) -> Result<raw::git_remote_callbacks, GitError> {
    let mut cbs: raw::git_remote_callbacks = unsafe { mem::zeroed() };
    crate::errors::check(unsafe {
        raw::git_remote_init_callbacks(&mut cbs, raw::GIT_REMOTE_CALLBACKS_VERSION)
    })?;
    // Every slot is installed so unset handlers still report through
    // the managed defaults.
    cbs.credentials = Some(credentials_cb);
    cbs.certificate_check = Some(certificate_check_cb);
    cbs.sideband_progress = Some(sideband_progress_cb);
    cbs.transfer_progress = Some(transfer_progress_cb);
    cbs.completion = Some(completion_cb);
    cbs.update_tips = Some(update_tips_cb);
    cbs.pack_progress = Some(pack_progress_cb);
    cbs.push_transfer_progress = Some(push_transfer_progress_cb);
    cbs.push_update_reference = Some(push_update_reference_cb);
    cbs.payload = payload.as_ptr();
    Ok(cbs)
}

/// Maps a managed outcome to a native status. `unset` is the status used when
/// no callback was installed.
fn status(remote: &RemoteInfo, outcome: Option<Result<(), GitError>>, unset: c_int) -> c_int {
    match outcome {
        None => unset,
        Some(Ok(())) => 0,
        Some(Err(GitError::Passthrough)) => GIT_PASSTHROUGH,
        Some(Err(err)) => {
            remote.stash_error(err);
            GIT_EUSER
        }
    }
}

fn remote_from_payload(payload: *mut c_void) -> Arc<RemoteInfo> {
    Bridge::global()
        .handles()
        .get(Handle::from_ptr(payload))
        .into_remote()
}

extern "C" fn credentials_cb(
    out: *mut *mut raw::git_cred,
    url: *const c_char,
    username_from_url: *const c_char,
    allowed_types: c_uint,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    let url = unsafe { from_cstr(url) }.unwrap_or_default();
    let username = unsafe { from_cstr(username_from_url) };
    let allowed = CredentialType::from_bits(allowed_types as u32);

    match remote.credentials(&url, username.as_deref(), allowed) {
        Ok(credential) => match credential.into_raw() {
            Ok(cred) => {
                unsafe { *out = cred };
                0
            }
            Err(err) => {
                remote.stash_error(err);
                GIT_EUSER
            }
        },
        Err(GitError::Passthrough) => GIT_PASSTHROUGH,
        Err(_) => GIT_EUSER,
    }
}

extern "C" fn certificate_check_cb(
    cert: *mut raw::git_cert,
    valid: c_int,
    host: *const c_char,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    let cert = unsafe { Certificate::from_raw(cert) };
    let host = unsafe { from_cstr(host) }.unwrap_or_default();
    let outcome = remote.with_callbacks(|cbs| {
        cbs.certificate_check
            .as_mut()
            .map(|cb| cb(&cert, valid != 0, &host))
    });
    status(&remote, outcome, GIT_PASSTHROUGH)
}

extern "C" fn sideband_progress_cb(str: *const c_char, len: c_int, payload: *mut c_void) -> c_int {
    let remote = remote_from_payload(payload);
    let text = if str.is_null() || len <= 0 {
        String::new()
    } else {
        let bytes = unsafe { slice::from_raw_parts(str as *const u8, len as usize) };
        String::from_utf8_lossy(bytes).into_owned()
    };
    let outcome = remote.with_callbacks(|cbs| cbs.sideband_progress.as_mut().map(|cb| cb(&text)));
    status(&remote, outcome, 0)
}

extern "C" fn transfer_progress_cb(
    stats: *const raw::git_indexer_progress,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    if stats.is_null() {
        return 0;
    }
    let progress = TransferProgress::from_raw(unsafe { &*stats });
    let outcome =
        remote.with_callbacks(|cbs| cbs.transfer_progress.as_mut().map(|cb| cb(&progress)));
    status(&remote, outcome, 0)
}

extern "C" fn completion_cb(kind: raw::git_remote_completion_type, payload: *mut c_void) -> c_int {
    let remote = remote_from_payload(payload);
    let kind = match kind {
        raw::GIT_REMOTE_COMPLETION_DOWNLOAD => RemoteCompletion::Download,
        raw::GIT_REMOTE_COMPLETION_INDEXING => RemoteCompletion::Indexing,
        _ => RemoteCompletion::Error,
    };
    let outcome = remote.with_callbacks(|cbs| cbs.completion.as_mut().map(|cb| cb(kind)));
    status(&remote, outcome, 0)
}

extern "C" fn update_tips_cb(
    refname: *const c_char,
    old: *const raw::git_oid,
    new: *const raw::git_oid,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    let refname = unsafe { from_cstr(refname) }.unwrap_or_default();
    let (old, new) = unsafe { (ObjectHash::from_raw_ptr(old), ObjectHash::from_raw_ptr(new)) };
    let outcome =
        remote.with_callbacks(|cbs| cbs.update_tips.as_mut().map(|cb| cb(&refname, old, new)));
    status(&remote, outcome, 0)
}

extern "C" fn pack_progress_cb(
    stage: raw::git_packbuilder_stage_t,
    current: c_uint,
    total: c_uint,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    let stage = if stage == raw::GIT_PACKBUILDER_ADDING_OBJECTS {
        PackbuilderStage::AddingObjects
    } else {
        PackbuilderStage::Deltafication
    };
    let outcome = remote.with_callbacks(|cbs| {
        cbs.pack_progress
            .as_mut()
            .map(|cb| cb(stage, current as u32, total as u32))
    });
    status(&remote, outcome, 0)
}

extern "C" fn push_transfer_progress_cb(
    current: c_uint,
    total: c_uint,
    bytes: size_t,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    let outcome = remote.with_callbacks(|cbs| {
        cbs.push_transfer_progress
            .as_mut()
            .map(|cb| cb(current as u32, total as u32, bytes as usize))
    });
    status(&remote, outcome, 0)
}

extern "C" fn push_update_reference_cb(
    refname: *const c_char,
    status_msg: *const c_char,
    payload: *mut c_void,
) -> c_int {
    let remote = remote_from_payload(payload);
    let refname = unsafe { from_cstr(refname) }.unwrap_or_default();
    let rejection = unsafe { from_cstr(status_msg) };
    let outcome = remote.with_callbacks(|cbs| {
        cbs.push_update_reference
            .as_mut()
            .map(|cb| cb(&refname, rejection.as_deref()))
    });
    status(&remote, outcome, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteInfo {
        RemoteInfo::new(Some("origin".into()), "foo://bar".into())
    }

    /// Unset handlers defer to native defaults.
    #[test]
    fn unset_callbacks_use_native_defaults() {
        let remote = remote();
        assert_eq!(status(&remote, None, GIT_PASSTHROUGH), GIT_PASSTHROUGH);
        assert_eq!(status(&remote, None, 0), 0);
        assert!(remote.take_error().is_none());
    }

    /// A callback error becomes `GIT_EUSER` and is kept for the caller.
    #[test]
    fn callback_error_is_stashed() {
        let remote = remote();
        let code = status(
            &remote,
            Some(Err(GitError::CustomError("progress aborted".into()))),
            0,
        );
        assert_eq!(code, GIT_EUSER);
        match remote.take_error() {
            Some(GitError::CustomError(msg)) => assert_eq!(msg, "progress aborted"),
            other => panic!("unexpected stash: {other:?}"),
        }
    }

    #[test]
    fn builder_installs_handlers() {
        let cbs = RemoteCallbacks::new()
            .sideband_progress(|_| Ok(()))
            .push_update_reference(|_, status| match status {
                None => Ok(()),
                Some(msg) => Err(GitError::CustomError(msg.to_string())),
            });
        let shown = format!("{cbs:?}");
        assert!(shown.contains("sideband_progress: true"));
        assert!(shown.contains("credentials: false"));
    }

    #[test]
    fn progress_is_copied_from_native_stats() {
        let stats = raw::git_indexer_progress {
            total_objects: 10,
            indexed_objects: 4,
            received_objects: 5,
            local_objects: 0,
            total_deltas: 2,
            indexed_deltas: 1,
            received_bytes: 4096,
        };
        let progress = TransferProgress::from_raw(&stats);
        assert_eq!(progress.total_objects, 10);
        assert_eq!(progress.received_bytes, 4096);
    }
}
