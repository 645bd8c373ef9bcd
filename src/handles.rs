//! Opaque handle table used to pass managed values through native `void*`
//! payloads and recover them when libgit2 calls back into Rust.
//!
//! A handle is the index of a slot in a growable arena. Slot `0` is reserved
//! so that a handle is never mistaken for a null payload. Released slots go
//! back to a free set and the smallest free index is handed out first.

use std::{
    collections::BTreeSet,
    ffi::c_void,
    fmt,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// Initial arena size, including the reserved slot.
const INITIAL_SLOTS: usize = 5;

/// Opaque token identifying one tracked value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    /// Encodes the handle as a native payload pointer. The pointer carries
    /// the slot index and must never be dereferenced.
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    /// Recovers a handle from a payload produced by [`Handle::as_ptr`].
    pub fn from_ptr(ptr: *mut c_void) -> Handle {
        Handle(ptr as usize)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Slots<T> {
    values: Vec<Option<T>>,
    free: BTreeSet<usize>,
}

/// Process-wide registry mapping handles to managed values.
///
/// `get` takes a shared lock and may run concurrently with other lookups;
/// `track` and `untrack` take the exclusive lock.
pub struct HandleTable<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        let mut values = Vec::with_capacity(INITIAL_SLOTS);
        values.resize_with(INITIAL_SLOTS, || None);
        Self {
            slots: RwLock::new(Slots {
                values,
                free: (1..INITIAL_SLOTS).collect(),
            }),
        }
    }

    // A poisoned table means a panic happened while the slot set was being
    // mutated; nothing handed out afterwards can be trusted.
    fn read(&self) -> RwLockReadGuard<'_, Slots<T>> {
        self.slots.read().expect("handle table lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots<T>> {
        self.slots.write().expect("handle table lock poisoned")
    }

    /// Starts tracking `value` and returns a handle that is not in use.
    pub fn track(&self, value: T) -> Handle {
        let mut slots = self.write();
        let index = match slots.free.pop_first() {
            Some(index) => index,
            None => {
                slots.values.push(None);
                slots.values.len() - 1
            }
        };
        slots.values[index] = Some(value);
        tracing::trace!(handle = index, "tracked value");
        Handle(index)
    }

    /// Stops tracking the value behind `handle` and hands it back.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not in use.
    pub fn untrack(&self, handle: Handle) -> T {
        let mut slots = self.write();
        let value = slots
            .values
            .get_mut(handle.0)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("invalid handle {handle}: untrack of an unused slot"));
        slots.free.insert(handle.0);
        tracing::trace!(handle = handle.0, "untracked value");
        value
    }

    /// Whether `handle` currently refers to a tracked value.
    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.read().values.get(handle.0), Some(Some(_)))
    }

    /// Number of values currently tracked.
    pub fn len(&self) -> usize {
        self.read().values.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> HandleTable<T> {
    /// Resolves `handle` to its tracked value.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not in use. Such a lookup means native code and
    /// Rust disagree about an object's lifetime, which cannot be recovered.
    pub fn get(&self, handle: Handle) -> T {
        self.try_get(handle)
            .unwrap_or_else(|| panic!("invalid handle {handle}: no value is tracked"))
    }

    /// Like [`HandleTable::get`] but returns `None` for unused handles.
    pub fn try_get(&self, handle: Handle) -> Option<T> {
        self.read().values.get(handle.0).and_then(Clone::clone)
    }
}
