//! Connection state of one subtransport instance.
//!
//! ```text
//!   Idle --action--> Connected(a) --close--> Idle
//!     \                  |  \
//!      \                 |   `--action(b), b continues a, stateful--> Connected(a) (same stream)
//!       \                `--action(b), otherwise--> [close] Connected(b)
//!        `--free--> Freed (from any state)
//! ```

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use crate::errors::GitError;
use crate::transport::core::{SmartSubtransport, SmartSubtransportStream};
use crate::transport::types::SmartServiceAction;

struct StreamCell {
    stream: Mutex<Box<dyn SmartSubtransportStream>>,
    freed: AtomicBool,
}

/// A stream shared between the native stream object and the session that
/// may hand it out again.
#[derive(Clone)]
pub struct SharedStream(Arc<StreamCell>);

impl SharedStream {
    pub fn new(stream: Box<dyn SmartSubtransportStream>) -> Self {
        SharedStream(Arc::new(StreamCell {
            stream: Mutex::new(stream),
            freed: AtomicBool::new(false),
        }))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn SmartSubtransportStream>>, GitError> {
        if self.is_freed() {
            return Err(GitError::CustomError("stream used after free".to_string()));
        }
        self.0
            .stream
            .lock()
            .map_err(|_| GitError::CustomError("stream lock poisoned".to_string()))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, GitError> {
        self.lock()?.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, GitError> {
        self.lock()?.write(buf)
    }

    /// Frees the underlying stream. Later calls are no-ops.
    pub fn free(&self) {
        if self.0.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.0.stream.lock() {
            Ok(mut stream) => stream.free(),
            Err(poisoned) => poisoned.into_inner().free(),
        }
    }

    pub fn is_freed(&self) -> bool {
        self.0.freed.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &SharedStream) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Observable phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connected(SmartServiceAction),
    Freed,
}

/// What a requested action does to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Open a new stream without touching the current one.
    Open,
    /// Hand out the current stream again.
    Reuse,
    /// Close the current exchange, then open a new stream.
    CloseThenOpen,
    Fail,
}

/// Transition table keyed by phase, requested action and statelessness.
pub fn transition(phase: Phase, requested: SmartServiceAction, stateless: bool) -> Transition {
    match phase {
        Phase::Freed => Transition::Fail,
        Phase::Idle => Transition::Open,
        Phase::Connected(current) if current.continues_with(requested) => {
            if stateless {
                Transition::Open
            } else {
                Transition::Reuse
            }
        }
        Phase::Connected(_) => Transition::CloseThenOpen,
    }
}

enum State {
    Idle,
    Connected {
        action: SmartServiceAction,
        stream: SharedStream,
    },
    Freed,
}

/// A managed subtransport driven through the transition table.
pub struct SubtransportSession {
    inner: Box<dyn SmartSubtransport>,
    stateless: bool,
    state: State,
}

impl SubtransportSession {
    pub fn new(inner: Box<dyn SmartSubtransport>, stateless: bool) -> Self {
        SubtransportSession {
            inner,
            stateless,
            state: State::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            State::Idle => Phase::Idle,
            State::Connected { action, .. } => Phase::Connected(*action),
            State::Freed => Phase::Freed,
        }
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    /// Returns the stream serving `action` on `url`.
    pub fn action(
        &mut self,
        url: &str,
        action: SmartServiceAction,
    ) -> Result<SharedStream, GitError> {
        let phase = self.phase();
        let step = transition(phase, action, self.stateless);
        tracing::debug!(?phase, %action, ?step, "subtransport action");
        match step {
            Transition::Fail => Err(GitError::SubtransportFreed),
            Transition::Reuse => {
                if let State::Connected { stream, .. } = &self.state {
                    return Ok(stream.clone());
                }
                self.open(url, action)
            }
            Transition::CloseThenOpen => {
                self.close()?;
                self.open(url, action)
            }
            Transition::Open => self.open(url, action),
        }
    }

    fn open(&mut self, url: &str, action: SmartServiceAction) -> Result<SharedStream, GitError> {
        let stream = SharedStream::new(self.inner.action(url, action)?);
        self.state = State::Connected {
            action,
            stream: stream.clone(),
        };
        Ok(stream)
    }

    /// Closes the current exchange and returns to `Idle`.
    pub fn close(&mut self) -> Result<(), GitError> {
        match self.state {
            State::Freed => Ok(()),
            _ => {
                self.state = State::Idle;
                self.inner.close()
            }
        }
    }

    /// Called when libgit2 frees `stream`; the session goes back to `Idle`
    /// if that was its current stream.
    pub fn release_stream(&mut self, stream: &SharedStream) {
        if let State::Connected { stream: current, .. } = &self.state {
            if current.ptr_eq(stream) {
                self.state = State::Idle;
            }
        }
    }

    /// Releases the current stream and the subtransport. Idempotent.
    pub fn free(&mut self) {
        match std::mem::replace(&mut self.state, State::Freed) {
            State::Freed => return,
            State::Connected { stream, .. } => stream.free(),
            State::Idle => {}
        }
        self.inner.free();
    }
}

impl Drop for SubtransportSession {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use SmartServiceAction::*;

    #[derive(Default)]
    struct Log(StdMutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct MockStream {
        log: Arc<Log>,
        action: SmartServiceAction,
    }

    impl SmartSubtransportStream for MockStream {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, GitError> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, GitError> {
            Ok(buf.len())
        }

        fn free(&mut self) {
            self.log.push(format!("free {}", self.action));
        }
    }

    struct MockSubtransport {
        log: Arc<Log>,
    }

    impl SmartSubtransport for MockSubtransport {
        fn action(
            &mut self,
            _url: &str,
            action: SmartServiceAction,
        ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
            self.log.push(format!("action {action}"));
            Ok(Box::new(MockStream {
                log: self.log.clone(),
                action,
            }))
        }

        fn close(&mut self) -> Result<(), GitError> {
            self.log.push("close");
            Ok(())
        }

        fn free(&mut self) {
            self.log.push("subtransport free");
        }
    }

    fn session(stateless: bool) -> (SubtransportSession, Arc<Log>) {
        let log = Arc::new(Log::default());
        let sub = MockSubtransport { log: log.clone() };
        (SubtransportSession::new(Box::new(sub), stateless), log)
    }

    #[test]
    fn transition_table() {
        assert_eq!(transition(Phase::Idle, UploadPack, false), Transition::Open);
        assert_eq!(
            transition(Phase::Connected(UploadPackLs), UploadPack, false),
            Transition::Reuse
        );
        assert_eq!(
            transition(Phase::Connected(ReceivePackLs), ReceivePack, false),
            Transition::Reuse
        );
        assert_eq!(
            transition(Phase::Connected(UploadPackLs), UploadPack, true),
            Transition::Open
        );
        assert_eq!(
            transition(Phase::Connected(UploadPackLs), ReceivePackLs, true),
            Transition::CloseThenOpen
        );
        assert_eq!(
            transition(Phase::Connected(UploadPackLs), ReceivePack, false),
            Transition::CloseThenOpen
        );
        assert_eq!(
            transition(Phase::Connected(UploadPack), UploadPack, false),
            Transition::CloseThenOpen
        );
        assert_eq!(transition(Phase::Freed, UploadPackLs, false), Transition::Fail);
    }

    /// An advertisement followed by its transfer reuses the same stream
    /// without closing.
    #[test]
    fn natural_progression_reuses_stream() {
        let (mut session, log) = session(false);
        let ls = session.action("foo://bar", UploadPackLs).unwrap();
        let pack = session.action("foo://bar", UploadPack).unwrap();
        assert!(ls.ptr_eq(&pack));
        assert_eq!(log.entries(), vec!["action git-upload-pack-ls"]);
        assert_eq!(session.phase(), Phase::Connected(UploadPackLs));
    }

    /// Switching service closes the open exchange before the next action.
    #[test]
    fn other_transition_closes_first() {
        let (mut session, log) = session(false);
        let upload = session.action("foo://bar", UploadPackLs).unwrap();
        let receive = session.action("foo://bar", ReceivePackLs).unwrap();
        assert!(!upload.ptr_eq(&receive));
        assert_eq!(
            log.entries(),
            vec![
                "action git-upload-pack-ls",
                "close",
                "action git-receive-pack-ls"
            ]
        );
        assert_eq!(session.phase(), Phase::Connected(ReceivePackLs));
    }

    #[test]
    fn stateless_progression_opens_fresh_stream() {
        let (mut session, log) = session(true);
        let ls = session.action("foo://bar", UploadPackLs).unwrap();
        let pack = session.action("foo://bar", UploadPack).unwrap();
        assert!(!ls.ptr_eq(&pack));
        assert_eq!(
            log.entries(),
            vec!["action git-upload-pack-ls", "action git-upload-pack"]
        );
    }

    /// Releasing the current stream returns to idle; a stale stream does not.
    #[test]
    fn release_stream_returns_to_idle() {
        let (mut session, _log) = session(true);
        let ls = session.action("foo://bar", UploadPackLs).unwrap();
        let pack = session.action("foo://bar", UploadPack).unwrap();
        session.release_stream(&ls);
        assert_eq!(session.phase(), Phase::Connected(UploadPack));
        session.release_stream(&pack);
        assert_eq!(session.phase(), Phase::Idle);
    }

    /// Free releases the open stream once and the subtransport once, even
    /// without a prior close.
    #[test]
    fn free_releases_everything_once() {
        let (mut session, log) = session(false);
        let stream = session.action("foo://bar", ReceivePackLs).unwrap();
        session.free();
        stream.free();
        session.free();
        assert_eq!(
            log.entries(),
            vec![
                "action git-receive-pack-ls",
                "free git-receive-pack-ls",
                "subtransport free"
            ]
        );
        assert!(stream.is_freed());
        assert!(stream.read(&mut [0u8; 4]).is_err());
        assert!(matches!(
            session.action("foo://bar", UploadPackLs),
            Err(GitError::SubtransportFreed)
        ));
    }

    #[test]
    fn drop_frees_subtransport() {
        let (session, log) = session(false);
        drop(session);
        assert_eq!(log.entries(), vec!["subtransport free"]);
    }
}
