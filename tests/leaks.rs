//! Handle accounting. Kept in its own binary so no other test shares the
//! bridge while the counts are compared.

use git_bridge::{
    Bridge, GitError, RemoteCallbacks, RemoteInfo, Repository, SmartServiceAction,
    SmartSubtransport, SmartSubtransportStream, SubtransportResult, Transport,
};
use tempfile::TempDir;

/// Stateless advertisement with a symbolic HEAD carrying the capabilities.
const ADVERTISEMENT: &[u8] = b"001e# service=git-upload-pack\n0000\
005d0000000000000000000000000000000000000000 HEAD\x00symref=HEAD:refs/heads/master agent=libgit\n\
003f0000000000000000000000000000000000000000 refs/heads/master\n\
0000";

struct Advertisement(&'static [u8]);

impl SmartSubtransportStream for Advertisement {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, GitError> {
        let n = buf.len().min(self.0.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0 = &self.0[n..];
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, GitError> {
        Ok(buf.len())
    }
}

struct Stub;

impl SmartSubtransport for Stub {
    fn action(
        &mut self,
        _url: &str,
        _action: SmartServiceAction,
    ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
        Ok(Box::new(Advertisement(ADVERTISEMENT)))
    }

    fn close(&mut self) -> Result<(), GitError> {
        Ok(())
    }
}

#[test]
fn operations_release_every_handle() {
    let bridge = Bridge::init();
    let baseline = Bridge::leaked_handles();

    let token = bridge
        .register_transport(
            "leakcheck",
            true,
            |_: Option<&RemoteInfo>, _: Transport| -> SubtransportResult { Ok(Box::new(Stub)) },
        )
        .unwrap();
    assert_eq!(Bridge::leaked_handles(), baseline + 1);

    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    for _ in 0..3 {
        let mut remote = repo.remote_anonymous("leakcheck://host/repo").unwrap();
        assert_eq!(Bridge::leaked_handles(), baseline + 2);
        remote.connect_fetch(RemoteCallbacks::new()).unwrap();
        assert_eq!(remote.ls().unwrap().len(), 2);
        drop(remote);
        assert_eq!(Bridge::leaked_handles(), baseline + 1);
    }

    drop(token);
    assert_eq!(Bridge::leaked_handles(), baseline);

    bridge.register_managed_http().unwrap();
    bridge.register_managed_ssh().unwrap();
    assert!(bridge.is_registered("git+ssh"));
    Bridge::shutdown().unwrap();
    Bridge::shutdown().unwrap();
    assert!(!bridge.is_registered("https"));
    assert!(!bridge.is_registered("ssh"));
    assert_eq!(Bridge::leaked_handles(), baseline);
}
