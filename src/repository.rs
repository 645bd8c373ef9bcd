//! Minimal repository handle: enough to create and look up remotes.

use std::{path::Path, ptr};

use libc::c_uint;
use libgit2_sys as raw;

use crate::{
    bridge::Bridge,
    errors::{GitError, check},
    remote::Remote,
    utils::{from_cstr, to_cstring},
};

/// An open repository.
pub struct Repository {
    raw: *mut raw::git_repository,
}

// libgit2 repositories may move between threads, not be shared across them.
unsafe impl Send for Repository {}

impl Repository {
    /// Creates a repository with a working directory at `path`.
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Repository, GitError> {
        Self::init_inner(path.as_ref(), false)
    }

    pub fn init_bare<P: AsRef<Path>>(path: P) -> Result<Repository, GitError> {
        Self::init_inner(path.as_ref(), true)
    }

    fn init_inner(path: &Path, bare: bool) -> Result<Repository, GitError> {
        Bridge::global();
        let path = to_cstring(&path.to_string_lossy())?;
        let mut out = ptr::null_mut();
        check(unsafe { raw::git_repository_init(&mut out, path.as_ptr(), bare as c_uint) })?;
        Ok(Repository { raw: out })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Repository, GitError> {
        Bridge::global();
        let path = to_cstring(&path.as_ref().to_string_lossy())?;
        let mut out = ptr::null_mut();
        check(unsafe { raw::git_repository_open(&mut out, path.as_ptr()) })?;
        Ok(Repository { raw: out })
    }

    /// Path of the `.git` directory, or of the repository itself when bare.
    pub fn path(&self) -> String {
        unsafe { from_cstr(raw::git_repository_path(self.raw)) }.unwrap_or_default()
    }

    pub fn is_bare(&self) -> bool {
        unsafe { raw::git_repository_is_bare(self.raw) == 1 }
    }

    /// Adds a named remote to the configuration.
    pub fn remote(&self, name: &str, url: &str) -> Result<Remote<'_>, GitError> {
        let name = to_cstring(name)?;
        let url = to_cstring(url)?;
        let mut out = ptr::null_mut();
        check(unsafe { raw::git_remote_create(&mut out, self.raw, name.as_ptr(), url.as_ptr()) })?;
        Ok(unsafe { Remote::from_raw(out) })
    }

    pub fn find_remote(&self, name: &str) -> Result<Remote<'_>, GitError> {
        let name = to_cstring(name)?;
        let mut out = ptr::null_mut();
        check(unsafe { raw::git_remote_lookup(&mut out, self.raw, name.as_ptr()) })?;
        Ok(unsafe { Remote::from_raw(out) })
    }

    /// A remote for `url` that is not stored in the configuration.
    pub fn remote_anonymous(&self, url: &str) -> Result<Remote<'_>, GitError> {
        let url = to_cstring(url)?;
        let mut out = ptr::null_mut();
        check(unsafe { raw::git_remote_create_anonymous(&mut out, self.raw, url.as_ptr()) })?;
        Ok(unsafe { Remote::from_raw(out) })
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        unsafe { raw::git_repository_free(self.raw) }
    }
}
