//! URL and runtime helpers shared by the built-in subtransports.

use std::{future::Future, mem::ManuallyDrop};

use tokio::runtime::{Handle, Runtime};

use crate::errors::GitError;
use crate::transport::types::ServiceType;

/// URL prefixes that select the SSH subtransport.
const SSH_PREFIXES: [&str; 3] = ["ssh://", "ssh+git://", "git+ssh://"];

/// Appends `suffix` to `base` with exactly one `/` between them.
pub fn join_url(base: &str, suffix: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        suffix.trim_start_matches('/')
    )
}

/// Parsed SSH remote location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parses `ssh://[user@]host[:port]/path` (and the `ssh+git`/`git+ssh`
/// spellings) or the scp-like `[user@]host:path`.
pub fn parse_ssh_url(url: &str, default_port: u16) -> Result<SshUrl, GitError> {
    let invalid = || GitError::InvalidUrl(url.to_string());

    if let Some(rest) = SSH_PREFIXES.iter().find_map(|p| url.strip_prefix(p)) {
        let (authority, path) = rest.find('/').map(|i| rest.split_at(i)).ok_or_else(invalid)?;
        let (user, hostport) = split_user(authority);
        let (host, port) = split_port(hostport).ok_or_else(invalid)?;
        // `ssh://host/~user/repo` names a home-relative path.
        let path = path.strip_prefix('/').filter(|p| p.starts_with('~')).unwrap_or(path);
        if host.is_empty() || path.trim_matches('/').is_empty() {
            return Err(invalid());
        }
        return Ok(SshUrl {
            user,
            host: host.to_string(),
            port: port.unwrap_or(default_port),
            path: path.to_string(),
        });
    }

    if url.contains("://") {
        return Err(invalid());
    }
    let (authority, path) = url.split_once(':').ok_or_else(invalid)?;
    let (user, host) = split_user(authority);
    if host.is_empty() || path.is_empty() {
        return Err(invalid());
    }
    Ok(SshUrl {
        user,
        host: host.to_string(),
        port: default_port,
        path: path.to_string(),
    })
}

fn split_user(authority: &str) -> (Option<String>, &str) {
    match authority.rsplit_once('@') {
        Some((user, host)) if !user.is_empty() => (Some(user.to_string()), host),
        Some((_, host)) => (None, host),
        None => (None, authority),
    }
}

fn split_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        };
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((hostport, None)),
    }
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Remote command that serves `service` for `path`.
pub fn ssh_command(service: ServiceType, path: &str) -> String {
    format!("{service} {}", shell_quote(path))
}

/// Runtime owned by a managed subtransport.
///
/// libgit2 calls the subtransports synchronously, so network I/O is driven
/// with [`TransportRuntime::block_on`]. Dropping it never waits on the
/// worker threads, so the last owner may be released on any thread.
pub(crate) struct TransportRuntime(ManuallyDrop<Runtime>);

impl TransportRuntime {
    pub(crate) fn new(name: &str, worker_threads: usize) -> Result<Self, GitError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(name)
            .enable_all()
            .build()?;
        Ok(TransportRuntime(ManuallyDrop::new(runtime)))
    }

    /// Runs `future` to completion. Blocking a thread that already drives a
    /// tokio runtime would panic across the FFI boundary, so that case is
    /// reported as [`GitError::AsyncContext`].
    pub(crate) fn block_on<F: Future>(&self, future: F) -> Result<F::Output, GitError> {
        if Handle::try_current().is_ok() {
            return Err(GitError::AsyncContext);
        }
        Ok(self.0.block_on(future))
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.0.spawn(future);
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        // SAFETY: the runtime is taken exactly once, here.
        let runtime = unsafe { ManuallyDrop::take(&mut self.0) };
        runtime.shutdown_background();
    }
}
