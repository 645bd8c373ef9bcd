//! Scheme-to-transport registry.
//!
//! libgit2 dispatches URLs to transports through its own process-wide table;
//! this registry mirrors it so a scheme can be re-registered (the previous
//! transport is torn down first) and everything can be undone at shutdown.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use libgit2_sys as raw;

use crate::{
    bridge::{Bridge, Tracked},
    errors::{GitError, check},
    handles::{Handle, HandleTable},
    transport::{core::SmartTransportFactory, raw::transport_cb},
    utils::to_cstring,
};

/// libgit2's `GIT_ENOTFOUND`.
const GIT_ENOTFOUND: i32 = -3;

/// A factory installed for one URL scheme.
pub struct RegisteredTransport {
    name: String,
    stateless: bool,
    factory: Box<dyn SmartTransportFactory>,
}

impl RegisteredTransport {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether each action runs as an independent request (smart HTTP) rather
    /// than over one long-lived stream.
    pub fn stateless(&self) -> bool {
        self.stateless
    }

    pub(crate) fn factory(&self) -> &dyn SmartTransportFactory {
        self.factory.as_ref()
    }
}

impl fmt::Debug for RegisteredTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTransport")
            .field("name", &self.name)
            .field("stateless", &self.stateless)
            .finish_non_exhaustive()
    }
}

struct Entry {
    id: u64,
    handle: Handle,
    transport: Arc<RegisteredTransport>,
}

#[derive(Default)]
pub(crate) struct TransportRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl TransportRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `factory` for `name`, replacing any earlier registration.
    /// Returns the registration id.
    pub(crate) fn register(
        &self,
        handles: &HandleTable<Tracked>,
        name: &str,
        stateless: bool,
        factory: Box<dyn SmartTransportFactory>,
    ) -> Result<u64, GitError> {
        let scheme = to_cstring(name)?;
        let mut entries = self.lock();
        if let Some(previous) = entries.remove(name) {
            tracing::debug!(scheme = name, id = previous.id, "replacing registered transport");
            teardown(handles, name, previous)?;
        }

        let transport = Arc::new(RegisteredTransport {
            name: name.to_string(),
            stateless,
            factory,
        });
        let handle = handles.track(Tracked::Transport(transport.clone()));
        let rc = unsafe { raw::git_transport_register(scheme.as_ptr(), Some(transport_cb), handle.as_ptr()) };
        if let Err(err) = check(rc) {
            handles.untrack(handle);
            return Err(err);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            name.to_string(),
            Entry {
                id,
                handle,
                transport,
            },
        );
        tracing::debug!(scheme = name, id, stateless, %handle, "registered transport");
        Ok(id)
    }

    /// Removes the registration for `name`. With `id`, only that exact
    /// registration is removed; a superseded id is a no-op.
    pub(crate) fn unregister(
        &self,
        handles: &HandleTable<Tracked>,
        name: &str,
        id: Option<u64>,
    ) -> Result<bool, GitError> {
        let mut entries = self.lock();
        match entries.get(name) {
            Some(entry) if id.is_none_or(|id| id == entry.id) => {}
            _ => return Ok(false),
        }
        let entry = entries.remove(name).ok_or_else(|| {
            GitError::CustomError(format!("transport `{name}` vanished while locked"))
        })?;
        teardown(handles, name, entry)?;
        Ok(true)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<RegisteredTransport>> {
        self.lock().get(name).map(|entry| entry.transport.clone())
    }

    /// Unregisters everything, returning the first failure.
    pub(crate) fn clear(&self, handles: &HandleTable<Tracked>) -> Result<(), GitError> {
        let mut entries = self.lock();
        let mut first_err = None;
        for (name, entry) in entries.drain() {
            if let Err(err) = teardown(handles, &name, entry) {
                tracing::warn!(scheme = %name, error = %err, "failed to unregister transport");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn teardown(handles: &HandleTable<Tracked>, name: &str, entry: Entry) -> Result<(), GitError> {
    let scheme = to_cstring(name)?;
    let rc = unsafe { raw::git_transport_unregister(scheme.as_ptr()) };
    handles.untrack(entry.handle);
    tracing::debug!(scheme = name, id = entry.id, "unregistered transport");
    drop(entry.transport);
    if rc == GIT_ENOTFOUND {
        return Ok(());
    }
    check(rc)
}

/// Token for a registered transport. Dropping it unregisters the transport
/// unless a later registration of the same scheme replaced it.
#[must_use = "dropping the token unregisters the transport"]
pub struct RegisteredSmartTransport {
    name: String,
    id: u64,
    freed: bool,
}

impl RegisteredSmartTransport {
    pub(crate) fn new(name: &str, id: u64) -> Self {
        RegisteredSmartTransport {
            name: name.to_string(),
            id,
            freed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unregisters the transport.
    pub fn free(mut self) -> Result<(), GitError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), GitError> {
        if std::mem::replace(&mut self.freed, true) {
            return Ok(());
        }
        let bridge = Bridge::global();
        let removed = bridge
            .transports()
            .unregister(bridge.handles(), &self.name, Some(self.id))?;
        if !removed {
            tracing::debug!(scheme = %self.name, id = self.id, "transport already superseded");
        }
        Ok(())
    }
}

impl Drop for RegisteredSmartTransport {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(scheme = %self.name, error = %err, "failed to free transport");
        }
    }
}
