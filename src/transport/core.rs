//! Core smart-transport interfaces
//!
//! A custom transport is a [`SmartTransportFactory`] registered for a URL
//! scheme. For every connection libgit2 makes to such a URL the factory
//! builds a [`SmartSubtransport`], which opens one
//! [`SmartSubtransportStream`] per smart-protocol action. libgit2 speaks the
//! pkt-line protocol over those streams; implementations only move bytes.
use std::sync::Arc;

use libc::c_int;

use crate::cert::Certificate;
use crate::credentials::{Credential, CredentialType};
use crate::errors::{ErrorClass, GIT_EUSER, GitError, set_native_error};
use crate::remote::RemoteInfo;
use crate::transport::types::SmartServiceAction;

/// One logical connection to a remote.
pub trait SmartSubtransport: Send {
    /// Opens a stream for `action` against `url`.
    fn action(
        &mut self,
        url: &str,
        action: SmartServiceAction,
    ) -> Result<Box<dyn SmartSubtransportStream>, GitError>;

    /// Ends the current exchange. Called before any transition that cannot
    /// reuse the open stream, and at teardown.
    fn close(&mut self) -> Result<(), GitError>;

    /// Releases everything; called exactly once, whether or not `close` ran.
    fn free(&mut self) {}
}

/// Duplex byte channel bound to one action.
pub trait SmartSubtransportStream: Send {
    /// Reads response bytes; `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, GitError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, GitError>;

    fn free(&mut self) {}
}

/// What a factory returns.
pub type SubtransportResult = Result<Box<dyn SmartSubtransport>, GitError>;

/// Builds subtransports for a registered scheme.
pub trait SmartTransportFactory: Send + Sync {
    fn create(&self, remote: Option<&RemoteInfo>, transport: Transport) -> SubtransportResult;
}

impl<F> SmartTransportFactory for F
where
    F: Fn(Option<&RemoteInfo>, Transport) -> SubtransportResult + Send + Sync,
{
    fn create(&self, remote: Option<&RemoteInfo>, transport: Transport) -> SubtransportResult {
        self(remote, transport)
    }
}

/// The native transport a subtransport runs under.
///
/// Gives subtransports access to the credential and certificate callbacks
/// installed on the owning remote for the current operation.
#[derive(Clone, Default)]
pub struct Transport {
    remote: Option<Arc<RemoteInfo>>,
}

impl Transport {
    pub(crate) fn new(remote: Option<Arc<RemoteInfo>>) -> Self {
        Transport { remote }
    }

    /// The managed remote that owns this connection, if any.
    pub fn remote(&self) -> Option<&RemoteInfo> {
        self.remote.as_deref()
    }

    /// Requests credentials of one of the `allowed` kinds from the owner's
    /// credentials callback, using the remote URL.
    ///
    /// Returns [`GitError::Passthrough`] when there is no callback to ask.
    pub fn smart_credentials(
        &self,
        username: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Credential, GitError> {
        match &self.remote {
            Some(remote) => remote.credentials(remote.url(), username, allowed),
            None => Err(GitError::Passthrough),
        }
    }

    /// Asks the owner's certificate-check callback about `cert`. `valid`
    /// carries the caller's own verdict, used when no callback is installed.
    pub fn smart_certificate_check(
        &self,
        cert: &Certificate,
        valid: bool,
        host: &str,
    ) -> Result<(), GitError> {
        match &self.remote {
            Some(remote) => remote.certificate_check(cert, valid, host),
            None if valid => Ok(()),
            None => Err(GitError::CertificateRejected(host.to_string())),
        }
    }

    /// Reports `err` to libgit2 and returns the status to hand back.
    ///
    /// With an owning remote the error is stashed for the top-level call and
    /// `GIT_EUSER` is returned; otherwise only its message survives, as a
    /// native network error.
    pub(crate) fn fail(&self, err: GitError) -> c_int {
        match &self.remote {
            Some(remote) => {
                remote.stash_error(err);
                GIT_EUSER
            }
            None => {
                tracing::debug!(error = %err, "subtransport failed without an owning remote");
                set_native_error(ErrorClass::NET, &err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteCallbacks;

    #[test]
    fn detached_transport_defers() {
        let transport = Transport::default();
        assert!(transport.remote().is_none());
        assert!(matches!(
            transport.smart_credentials(None, CredentialType::SSH_KEY),
            Err(GitError::Passthrough)
        ));
        let cert = Certificate::None;
        assert!(transport.smart_certificate_check(&cert, true, "h").is_ok());
        assert!(transport.smart_certificate_check(&cert, false, "h").is_err());
    }

    /// Credentials requests carry the remote URL and the username hint.
    #[test]
    fn credentials_route_to_owner() {
        let remote = Arc::new(RemoteInfo::new(None, "https://example.com/r.git".into()));
        remote.install(RemoteCallbacks::new().credentials(|url, user, allowed| {
            assert_eq!(url, "https://example.com/r.git");
            assert_eq!(user, Some("git"));
            assert!(allowed.contains(CredentialType::SSH_KEY));
            Ok(Credential::ssh_key_from_agent("git"))
        }));
        let transport = Transport::new(Some(remote));
        let cred = transport
            .smart_credentials(Some("git"), CredentialType::SSH_KEY | CredentialType::SSH_MEMORY)
            .unwrap();
        assert_eq!(cred.kind(), CredentialType::SSH_KEY);
    }

    #[test]
    fn fail_stashes_on_owner() {
        let remote = Arc::new(RemoteInfo::new(None, "foo://bar".into()));
        let transport = Transport::new(Some(remote.clone()));
        assert_eq!(transport.fail(GitError::Ssh("dial failed".into())), GIT_EUSER);
        assert!(matches!(remote.take_error(), Some(GitError::Ssh(_))));
    }
}
