use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use git_bridge::{
    Bridge, Certificate, Credential, CredentialType, GitError, HostkeyCertificate, RemoteCallbacks,
    RemoteInfo, Repository, SmartServiceAction, SmartSubtransport, SmartSubtransportStream,
    SubtransportResult, Transport,
};
use tempfile::TempDir;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path, query_param},
};

/// Smart advertisement with a symbolic HEAD and one branch.
const ADVERTISEMENT: &[u8] = b"001e# service=git-upload-pack\n0000\
005d0000000000000000000000000000000000000000 HEAD\x00symref=HEAD:refs/heads/master agent=libgit\n\
003f0000000000000000000000000000000000000000 refs/heads/master\n\
0000";

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Stream replaying a fixed payload.
struct PayloadStream {
    remaining: &'static [u8],
}

impl SmartSubtransportStream for PayloadStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, GitError> {
        let n = buf.len().min(self.remaining.len());
        buf[..n].copy_from_slice(&self.remaining[..n]);
        self.remaining = &self.remaining[n..];
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, GitError> {
        Ok(buf.len())
    }
}

/// Subtransport serving [`ADVERTISEMENT`] for every action and recording the
/// actions it saw.
#[derive(Default)]
struct StubSubtransport {
    actions: Arc<Mutex<Vec<SmartServiceAction>>>,
}

impl SmartSubtransport for StubSubtransport {
    fn action(
        &mut self,
        url: &str,
        action: SmartServiceAction,
    ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
        assert!(url.ends_with("://bar"), "unexpected url {url}");
        self.actions.lock().unwrap().push(action);
        Ok(Box::new(PayloadStream {
            remaining: ADVERTISEMENT,
        }))
    }

    fn close(&mut self) -> Result<(), GitError> {
        Ok(())
    }
}

fn scratch_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    (dir, repo)
}

#[test]
fn custom_transport_lists_advertised_refs() {
    init_logger();
    let actions = Arc::new(Mutex::new(Vec::new()));
    let seen = actions.clone();
    let _token = Bridge::init()
        .register_transport(
            "foo",
            true,
            move |_: Option<&RemoteInfo>, _: Transport| -> SubtransportResult {
                Ok(Box::new(StubSubtransport {
                    actions: seen.clone(),
                }))
            },
        )
        .unwrap();
    assert_eq!(Bridge::init().is_stateless("foo"), Some(true));

    let (_dir, repo) = scratch_repo();
    let mut remote = repo.remote_anonymous("foo://bar").unwrap();
    remote.connect_fetch(RemoteCallbacks::new()).unwrap();
    assert!(remote.connected());

    let heads = remote.ls().unwrap();
    let names: Vec<&str> = heads.iter().map(|head| head.name.as_str()).collect();
    assert_eq!(names, ["HEAD", "refs/heads/master"]);
    assert!(heads.iter().all(|head| head.oid.is_zero()));
    assert_eq!(
        actions.lock().unwrap().first(),
        Some(&SmartServiceAction::UploadPackLs)
    );

    remote.disconnect().unwrap();
}

struct DropFlag(Arc<AtomicBool>);

impl DropFlag {
    fn touch(&self) {}
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Registering a scheme twice releases the first factory, and the stale
/// token no longer controls the scheme.
#[test]
fn reregistration_supersedes_previous_factory() {
    init_logger();
    let bridge = Bridge::init();
    let first_dropped = Arc::new(AtomicBool::new(false));
    let guard = DropFlag(first_dropped.clone());
    let first = bridge
        .register_transport(
            "supersede",
            false,
            move |_: Option<&RemoteInfo>, _: Transport| -> SubtransportResult {
                guard.touch();
                Ok(Box::new(StubSubtransport::default()))
            },
        )
        .unwrap();
    assert!(!first_dropped.load(Ordering::SeqCst));

    let second = bridge
        .register_transport(
            "supersede",
            true,
            |_: Option<&RemoteInfo>, _: Transport| -> SubtransportResult {
                Ok(Box::new(StubSubtransport::default()))
            },
        )
        .unwrap();
    assert!(first_dropped.load(Ordering::SeqCst));
    assert_eq!(bridge.is_stateless("supersede"), Some(true));

    first.free().unwrap();
    assert!(bridge.is_registered("supersede"));

    second.free().unwrap();
    assert!(!bridge.is_registered("supersede"));
}

/// The error a certificate callback returns is the error the connect call
/// reports.
#[test]
fn certificate_callback_error_is_returned_unchanged() {
    init_logger();
    let _token = Bridge::init()
        .register_transport(
            "certcheck",
            false,
            |_: Option<&RemoteInfo>, transport: Transport| -> SubtransportResult {
                Ok(Box::new(CheckingSubtransport { transport }))
            },
        )
        .unwrap();

    struct CheckingSubtransport {
        transport: Transport,
    }

    impl SmartSubtransport for CheckingSubtransport {
        fn action(
            &mut self,
            _url: &str,
            _action: SmartServiceAction,
        ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
            let cert = Certificate::Hostkey(HostkeyCertificate::from_key(b"ssh-ed25519 test"));
            self.transport.smart_certificate_check(&cert, false, "bar")?;
            Ok(Box::new(PayloadStream {
                remaining: ADVERTISEMENT,
            }))
        }

        fn close(&mut self) -> Result<(), GitError> {
            Ok(())
        }
    }

    let (_dir, repo) = scratch_repo();
    let mut remote = repo.remote_anonymous("certcheck://bar").unwrap();
    let callbacks = RemoteCallbacks::new().certificate_check(|cert, valid, host| {
        assert!(!valid);
        assert_eq!(host, "bar");
        assert!(cert.as_hostkey().is_some());
        Err(GitError::CustomError("untrusted host key".to_string()))
    });
    match remote.connect_fetch(callbacks) {
        Err(GitError::CustomError(message)) => assert_eq!(message, "untrusted host key"),
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Failures inside a stream surface as the stream's own error.
#[test]
fn stream_errors_reach_the_caller() {
    init_logger();

    struct FailingStream;

    impl SmartSubtransportStream for FailingStream {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, GitError> {
            Err(GitError::Ssh("connection reset".to_string()))
        }

        fn write(&mut self, _buf: &[u8]) -> Result<usize, GitError> {
            Ok(0)
        }
    }

    struct FailingSubtransport;

    impl SmartSubtransport for FailingSubtransport {
        fn action(
            &mut self,
            _url: &str,
            _action: SmartServiceAction,
        ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
            Ok(Box::new(FailingStream))
        }

        fn close(&mut self) -> Result<(), GitError> {
            Ok(())
        }
    }

    let _token = Bridge::init()
        .register_transport(
            "failing",
            false,
            |_: Option<&RemoteInfo>, _: Transport| -> SubtransportResult {
                Ok(Box::new(FailingSubtransport))
            },
        )
        .unwrap();

    let (_dir, repo) = scratch_repo();
    let mut remote = repo.remote_anonymous("failing://bar").unwrap();
    let err = remote.connect_fetch(RemoteCallbacks::new()).unwrap_err();
    assert!(matches!(err, GitError::Ssh(ref m) if m == "connection reset"), "{err:?}");
}

#[test]
fn subtransports_can_ask_for_credentials() {
    init_logger();

    struct AuthenticatingSubtransport {
        transport: Transport,
    }

    impl SmartSubtransport for AuthenticatingSubtransport {
        fn action(
            &mut self,
            _url: &str,
            _action: SmartServiceAction,
        ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
            match self
                .transport
                .smart_credentials(Some("git"), CredentialType::USERPASS_PLAINTEXT)?
            {
                Credential::UserpassPlaintext { username, .. } if username == "git" => {
                    Ok(Box::new(PayloadStream {
                        remaining: ADVERTISEMENT,
                    }))
                }
                other => Err(GitError::InvalidCredential(format!("{other:?}"))),
            }
        }

        fn close(&mut self) -> Result<(), GitError> {
            Ok(())
        }
    }

    let _token = Bridge::init()
        .register_transport(
            "creds",
            true,
            |remote: Option<&RemoteInfo>, transport: Transport| -> SubtransportResult {
                assert_eq!(remote.map(|r| r.url()), Some("creds://bar"));
                Ok(Box::new(AuthenticatingSubtransport { transport }))
            },
        )
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (_dir, repo) = scratch_repo();
    let mut remote = repo.remote("origin", "creds://bar").unwrap();
    remote
        .connect_fetch(RemoteCallbacks::new().credentials(move |url, username, allowed| {
            assert_eq!(url, "creds://bar");
            assert_eq!(username, Some("git"));
            assert!(allowed.contains(CredentialType::USERPASS_PLAINTEXT));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::userpass_plaintext("git", "hunter2"))
        }))
        .unwrap();
    assert_eq!(remote.ls().unwrap().len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// libgit2 talking to a wiremock server through the managed HTTP transport,
/// including the 401 round trip.
#[test]
fn managed_http_fetches_advertisement_after_auth() {
    init_logger();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(async {
        Mock::given(method("GET"))
            .and(path("/repo.git/info/refs"))
            .and(query_param("service", "git-upload-pack"))
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                ADVERTISEMENT,
                "application/x-git-upload-pack-advertisement",
            ))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repo.git/info/refs"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
    });

    Bridge::init().register_managed_http().unwrap();
    assert!(Bridge::init().is_registered("http"));
    assert_eq!(Bridge::init().is_stateless("https"), Some(true));

    let (_dir, repo) = scratch_repo();
    let url = format!("{}/repo.git", server.uri());
    let mut remote = repo.remote_anonymous(&url).unwrap();
    remote
        .connect_fetch(RemoteCallbacks::new().credentials(|_, _, _| {
            Ok(Credential::userpass_plaintext("alice", "secret"))
        }))
        .unwrap();
    let names: Vec<String> = remote.ls().unwrap().into_iter().map(|h| h.name).collect();
    assert_eq!(names, ["HEAD", "refs/heads/master"]);
    drop(remote);
    rt.block_on(server.verify());
}

/// Receive-pack advertisement for a stateful transport: no service line, one
/// flush, `refs/heads/master` at a non-zero id.
const RECEIVE_ADVERTISEMENT: &[u8] = b"0066\
1111111111111111111111111111111111111111 refs/heads/master\x00report-status delete-refs agent=libgit\n\
0000";

const REPORT: &[u8] = b"000eunpack ok\n0019ok refs/heads/master\n0000";

/// Serves the advertisement, then the status report once commands arrive.
struct ReceivePackStream {
    advertisement: &'static [u8],
    report: &'static [u8],
    commands: Arc<Mutex<Vec<u8>>>,
}

impl SmartSubtransportStream for ReceivePackStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, GitError> {
        let source = if !self.advertisement.is_empty() {
            &mut self.advertisement
        } else if !self.commands.lock().unwrap().is_empty() {
            &mut self.report
        } else {
            return Ok(0);
        };
        let n = buf.len().min(source.len());
        buf[..n].copy_from_slice(&source[..n]);
        *source = &source[n..];
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, GitError> {
        self.commands.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// A stateful push opens one receive-pack stream, reuses it for the
/// transfer and reports the accepted update per reference.
#[test]
fn stateful_push_reuses_the_stream() {
    init_logger();

    struct ReceivePackSubtransport {
        actions: Arc<Mutex<Vec<SmartServiceAction>>>,
        commands: Arc<Mutex<Vec<u8>>>,
    }

    impl SmartSubtransport for ReceivePackSubtransport {
        fn action(
            &mut self,
            _url: &str,
            action: SmartServiceAction,
        ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
            self.actions.lock().unwrap().push(action);
            Ok(Box::new(ReceivePackStream {
                advertisement: RECEIVE_ADVERTISEMENT,
                report: REPORT,
                commands: self.commands.clone(),
            }))
        }

        fn close(&mut self) -> Result<(), GitError> {
            Ok(())
        }
    }

    let actions = Arc::new(Mutex::new(Vec::new()));
    let commands = Arc::new(Mutex::new(Vec::new()));
    let (seen_actions, seen_commands) = (actions.clone(), commands.clone());
    let _token = Bridge::init()
        .register_transport(
            "pushonly",
            false,
            move |_: Option<&RemoteInfo>, _: Transport| -> SubtransportResult {
                Ok(Box::new(ReceivePackSubtransport {
                    actions: seen_actions.clone(),
                    commands: seen_commands.clone(),
                }))
            },
        )
        .unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let recorded = updates.clone();
    let (_dir, repo) = scratch_repo();
    let mut remote = repo.remote_anonymous("pushonly://bar").unwrap();
    remote
        .push(
            &[":refs/heads/master"],
            RemoteCallbacks::new().push_update_reference(move |name, status| {
                recorded
                    .lock()
                    .unwrap()
                    .push((name.to_string(), status.map(str::to_string)));
                Ok(())
            }),
        )
        .unwrap();

    assert_eq!(*actions.lock().unwrap(), [SmartServiceAction::ReceivePackLs]);
    let sent = String::from_utf8_lossy(&commands.lock().unwrap()).into_owned();
    assert!(sent.contains("refs/heads/master"), "{sent}");
    assert_eq!(
        *updates.lock().unwrap(),
        [("refs/heads/master".to_string(), None)]
    );
}

/// An error from the credentials callback during the 401 round trip is what
/// the connect call reports.
#[test]
fn managed_http_credentials_error_is_returned_unchanged() {
    init_logger();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/private.git/info/refs"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server),
    );

    Bridge::init().register_managed_http().unwrap();
    let (_dir, repo) = scratch_repo();
    let url = format!("{}/private.git", server.uri());
    let mut remote = repo.remote_anonymous(&url).unwrap();
    let err = remote
        .connect_fetch(
            RemoteCallbacks::new()
                .credentials(|_, _, _| Err(GitError::CustomError("nope".to_string()))),
        )
        .unwrap_err();
    assert!(matches!(err, GitError::CustomError(ref m) if m == "nope"), "{err:?}");
    drop(remote);
    rt.block_on(server.verify());
}
