//! Process-wide bridge state.
//!
//! libgit2 resolves URL schemes through one global table, so the objects its
//! callbacks need (registered factories, live subtransports and streams,
//! remote callback contexts) live in a single [`Bridge`] instance created by
//! [`Bridge::init`] and torn down by [`Bridge::shutdown`].

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use libgit2_sys as raw;

use crate::{
    config::BridgeConfig,
    errors::GitError,
    handles::HandleTable,
    remote::{RemoteInfo, RemoteRegistry},
    transport::{
        core::{SmartTransportFactory, SubtransportResult, Transport},
        http::HttpSubtransport,
        raw::{StreamEntry, SubtransportEntry},
        registry::{RegisteredSmartTransport, RegisteredTransport, TransportRegistry},
        ssh::SshSubtransport,
    },
};

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// Schemes served by the built-in HTTP subtransport.
pub const HTTP_SCHEMES: [&str; 2] = ["http", "https"];
/// Schemes served by the built-in SSH subtransport.
pub const SSH_SCHEMES: [&str; 3] = ["ssh", "ssh+git", "git+ssh"];

/// Everything native code may refer to by handle.
#[derive(Clone)]
pub(crate) enum Tracked {
    Transport(Arc<RegisteredTransport>),
    Subtransport(Arc<SubtransportEntry>),
    Stream(Arc<StreamEntry>),
    Remote(Arc<RemoteInfo>),
}

impl Tracked {
    fn kind(&self) -> &'static str {
        match self {
            Tracked::Transport(_) => "transport",
            Tracked::Subtransport(_) => "subtransport",
            Tracked::Stream(_) => "stream",
            Tracked::Remote(_) => "remote",
        }
    }

    pub(crate) fn into_transport(self) -> Arc<RegisteredTransport> {
        match self {
            Tracked::Transport(t) => t,
            other => panic!("invalid handle: expected transport, found {}", other.kind()),
        }
    }

    pub(crate) fn into_subtransport(self) -> Arc<SubtransportEntry> {
        match self {
            Tracked::Subtransport(s) => s,
            other => panic!("invalid handle: expected subtransport, found {}", other.kind()),
        }
    }

    pub(crate) fn into_stream(self) -> Arc<StreamEntry> {
        match self {
            Tracked::Stream(s) => s,
            other => panic!("invalid handle: expected stream, found {}", other.kind()),
        }
    }

    pub(crate) fn into_remote(self) -> Arc<RemoteInfo> {
        match self {
            Tracked::Remote(r) => r,
            other => panic!("invalid handle: expected remote, found {}", other.kind()),
        }
    }
}

/// The single registry object shared with libgit2's callbacks.
pub struct Bridge {
    config: BridgeConfig,
    handles: HandleTable<Tracked>,
    remotes: RemoteRegistry,
    transports: TransportRegistry,
    builtin: Mutex<Vec<RegisteredSmartTransport>>,
}

impl Bridge {
    /// Initialises libgit2 and the bridge with default settings. Later calls
    /// return the same instance.
    pub fn init() -> &'static Bridge {
        Self::init_with(BridgeConfig::default())
    }

    /// Like [`Bridge::init`]; `config` only applies to the first call.
    pub fn init_with(config: BridgeConfig) -> &'static Bridge {
        BRIDGE.get_or_init(|| {
            raw::init();
            tracing::debug!(?config, "initialised git bridge");
            Bridge {
                config,
                handles: HandleTable::new(),
                remotes: RemoteRegistry::new(),
                transports: TransportRegistry::default(),
                builtin: Mutex::new(Vec::new()),
            }
        })
    }

    pub(crate) fn global() -> &'static Bridge {
        Self::init()
    }

    /// Unregisters every installed transport. Safe to call repeatedly, and a
    /// no-op before [`Bridge::init`].
    pub fn shutdown() -> Result<(), GitError> {
        let Some(bridge) = BRIDGE.get() else {
            return Ok(());
        };
        let builtin: Vec<_> = bridge
            .builtin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let mut first_err = None;
        for token in builtin {
            if let Err(err) = token.free() {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = bridge.transports.clear(&bridge.handles) {
            first_err.get_or_insert(err);
        }
        tracing::debug!(tracked = bridge.handles.len(), "git bridge shut down");
        first_err.map_or(Ok(()), Err)
    }

    /// Number of handles still tracked. Registered transports and live
    /// remotes hold one each; anything else left after an operation leaked.
    pub fn leaked_handles() -> usize {
        BRIDGE.get().map_or(0, |bridge| bridge.handles.len())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn handles(&self) -> &HandleTable<Tracked> {
        &self.handles
    }

    pub(crate) fn remotes(&self) -> &RemoteRegistry {
        &self.remotes
    }

    pub(crate) fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Installs `factory` for URLs starting with `name://`. A previous
    /// registration for the same scheme is torn down first.
    pub fn register_transport<F>(
        &self,
        name: &str,
        stateless: bool,
        factory: F,
    ) -> Result<RegisteredSmartTransport, GitError>
    where
        F: SmartTransportFactory + 'static,
    {
        let id = self
            .transports
            .register(&self.handles, name, stateless, Box::new(factory))?;
        Ok(RegisteredSmartTransport::new(name, id))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.transports.contains(name)
    }

    /// Whether `name` is served statelessly; `None` when unregistered.
    pub fn is_stateless(&self, name: &str) -> Option<bool> {
        self.transports.get(name).map(|t| t.stateless())
    }

    /// Serves `http` and `https` with the built-in HTTP subtransport until
    /// [`Bridge::shutdown`].
    pub fn register_managed_http(&self) -> Result<(), GitError> {
        for scheme in HTTP_SCHEMES {
            let config = self.config.http.clone();
            let token = self.register_transport(
                scheme,
                true,
                move |_: Option<&RemoteInfo>, transport: Transport| -> SubtransportResult {
                    Ok(Box::new(HttpSubtransport::new(transport, config.clone())))
                },
            )?;
            self.keep(token);
        }
        Ok(())
    }

    /// Serves `ssh`, `ssh+git` and `git+ssh` with the built-in SSH
    /// subtransport until [`Bridge::shutdown`].
    pub fn register_managed_ssh(&self) -> Result<(), GitError> {
        for scheme in SSH_SCHEMES {
            let config = self.config.ssh.clone();
            let token = self.register_transport(
                scheme,
                false,
                move |_: Option<&RemoteInfo>, transport: Transport| -> SubtransportResult {
                    Ok(Box::new(SshSubtransport::new(transport, config.clone())))
                },
            )?;
            self.keep(token);
        }
        Ok(())
    }

    fn keep(&self, token: RegisteredSmartTransport) {
        let mut builtin = self.builtin.lock().unwrap_or_else(PoisonError::into_inner);
        // A re-registration already replaced the earlier token's transport.
        builtin.retain(|t| t.name() != token.name());
        builtin.push(token);
    }
}
