//! Lookup from a native `git_remote` to its managed state.
//!
//! libgit2 hands transport factories the owning `git_remote*` and nothing
//! else, so the factory trampoline resolves the managed [`RemoteInfo`] here.

use std::sync::Arc;

use dashmap::DashMap;
use libgit2_sys as raw;

use super::RemoteInfo;

/// Concurrent map keyed by the native remote's address.
#[derive(Default)]
pub struct RemoteRegistry {
    remotes: DashMap<usize, Arc<RemoteInfo>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, remote: *const raw::git_remote, info: Arc<RemoteInfo>) {
        if self.remotes.insert(remote as usize, info).is_some() {
            tracing::warn!(remote = remote as usize, "replaced a registered remote");
        }
    }

    pub(crate) fn remove(&self, remote: *const raw::git_remote) -> Option<Arc<RemoteInfo>> {
        self.remotes.remove(&(remote as usize)).map(|(_, info)| info)
    }

    /// Managed state for `remote`, if a managed `Remote` owns it.
    pub(crate) fn get(&self, remote: *const raw::git_remote) -> Option<Arc<RemoteInfo>> {
        self.remotes
            .get(&(remote as usize))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_native_address() {
        let registry = RemoteRegistry::new();
        let key = 0x1000 as *const raw::git_remote;
        let info = Arc::new(RemoteInfo::new(Some("origin".into()), "foo://bar".into()));

        registry.insert(key, info.clone());
        assert_eq!(registry.len(), 1);
        let found = registry.get(key).unwrap();
        assert!(Arc::ptr_eq(&found, &info));
        assert!(registry.get(0x2000 as *const raw::git_remote).is_none());

        registry.remove(key);
        assert!(registry.is_empty());
        assert!(registry.get(key).is_none());
    }
}
