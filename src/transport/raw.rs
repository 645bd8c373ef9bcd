//! Native vtables for managed subtransports.
//!
//! libgit2 sees each subtransport and stream as a `#[repr(C)]` struct whose
//! first field is the libgit2 vtable. The only other state is a handle into
//! the bridge's table, so every callback resolves its managed object there
//! and a stale pointer fails loudly instead of aliasing freed memory.

use std::{
    ffi::c_void,
    ptr, slice,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use libc::{c_char, c_int, c_uint, size_t};
use libgit2_sys as raw;

use crate::{
    bridge::{Bridge, Tracked},
    errors::GitError,
    handles::Handle,
    transport::{
        core::Transport,
        state::{SharedStream, SubtransportSession},
        types::SmartServiceAction,
    },
    utils::from_cstr,
};

/// Managed side of one native subtransport.
pub(crate) struct SubtransportEntry {
    session: Mutex<SubtransportSession>,
    transport: Transport,
}

impl SubtransportEntry {
    fn session(&self) -> MutexGuard<'_, SubtransportSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Managed side of one native stream.
pub(crate) struct StreamEntry {
    stream: SharedStream,
    owner: Arc<SubtransportEntry>,
}

#[repr(C)]
struct RawSmartSubtransport {
    parent: raw::git_smart_subtransport,
    handle: Handle,
    /// Most recent stream handed to libgit2, null once it is freed.
    stream: *mut RawSmartSubtransportStream,
    attached: bool,
}

#[repr(C)]
struct RawSmartSubtransportStream {
    parent: raw::git_smart_subtransport_stream,
    handle: Handle,
}

/// Entry point registered with `git_transport_register`; `param` is the
/// handle of the registered transport.
pub(crate) extern "C" fn transport_cb(
    out: *mut *mut raw::git_transport,
    owner: *mut raw::git_remote,
    param: *mut c_void,
) -> c_int {
    let bridge = Bridge::global();
    let registered = bridge.handles().get(Handle::from_ptr(param)).into_transport();
    let remote = bridge.remotes().get(owner);
    let transport = Transport::new(remote.clone());

    let subtransport = match registered.factory().create(remote.as_deref(), transport.clone()) {
        Ok(subtransport) => subtransport,
        Err(err) => {
            tracing::debug!(scheme = registered.name(), error = %err, "transport factory failed");
            return transport.fail(err);
        }
    };

    let entry = Arc::new(SubtransportEntry {
        session: Mutex::new(SubtransportSession::new(subtransport, registered.stateless())),
        transport,
    });
    let handle = bridge.handles().track(Tracked::Subtransport(entry));
    let raw_sub = Box::into_raw(Box::new(RawSmartSubtransport {
        parent: raw::git_smart_subtransport {
            action: Some(subtransport_action),
            close: Some(subtransport_close),
            free: Some(subtransport_free),
        },
        handle,
        stream: ptr::null_mut(),
        attached: false,
    }));

    let mut definition = raw::git_smart_subtransport_definition {
        callback: Some(subtransport_cb),
        rpc: registered.stateless() as c_uint,
        param: raw_sub as *mut c_void,
    };
    let rc = unsafe {
        raw::git_transport_smart(out, owner, &mut definition as *mut _ as *mut c_void)
    };
    if rc < 0 && unsafe { !(*raw_sub).attached } {
        // libgit2 never took ownership; reclaim everything here.
        let raw_sub = unsafe { Box::from_raw(raw_sub) };
        let entry = bridge.handles().untrack(raw_sub.handle).into_subtransport();
        entry.session().free();
    }
    rc
}

extern "C" fn subtransport_cb(
    out: *mut *mut raw::git_smart_subtransport,
    _owner: *mut raw::git_transport,
    param: *mut c_void,
) -> c_int {
    let raw_sub = param as *mut RawSmartSubtransport;
    unsafe {
        (*raw_sub).attached = true;
        *out = raw_sub as *mut raw::git_smart_subtransport;
    }
    0
}

extern "C" fn subtransport_action(
    out: *mut *mut raw::git_smart_subtransport_stream,
    subtransport: *mut raw::git_smart_subtransport,
    url: *const c_char,
    action: raw::git_smart_service_t,
) -> c_int {
    let raw_sub = subtransport as *mut RawSmartSubtransport;
    let bridge = Bridge::global();
    let entry = bridge
        .handles()
        .get(unsafe { (*raw_sub).handle })
        .into_subtransport();
    let url = unsafe { from_cstr(url) }.unwrap_or_default();

    let result = SmartServiceAction::from_raw(action)
        .and_then(|action| entry.session().action(&url, action));
    let stream = match result {
        Ok(stream) => stream,
        Err(err) => return entry.transport.fail(err),
    };

    // A reused stream keeps its native object; libgit2 checks identity.
    let live = unsafe { (*raw_sub).stream };
    if !live.is_null() {
        let reused = bridge
            .handles()
            .try_get(unsafe { (*live).handle })
            .map(Tracked::into_stream)
            .is_some_and(|current| current.stream.ptr_eq(&stream));
        if reused {
            unsafe { *out = live as *mut raw::git_smart_subtransport_stream };
            return 0;
        }
    }

    let handle = bridge.handles().track(Tracked::Stream(Arc::new(StreamEntry {
        stream,
        owner: entry.clone(),
    })));
    let raw_stream = Box::into_raw(Box::new(RawSmartSubtransportStream {
        parent: raw::git_smart_subtransport_stream {
            subtransport,
            read: Some(stream_read),
            write: Some(stream_write),
            free: Some(stream_free),
        },
        handle,
    }));
    unsafe {
        (*raw_sub).stream = raw_stream;
        *out = raw_stream as *mut raw::git_smart_subtransport_stream;
    }
    0
}

extern "C" fn subtransport_close(subtransport: *mut raw::git_smart_subtransport) -> c_int {
    let raw_sub = subtransport as *mut RawSmartSubtransport;
    let entry = Bridge::global()
        .handles()
        .get(unsafe { (*raw_sub).handle })
        .into_subtransport();
    let result = entry.session().close();
    match result {
        Ok(()) => 0,
        Err(err) => entry.transport.fail(err),
    }
}

extern "C" fn subtransport_free(subtransport: *mut raw::git_smart_subtransport) {
    let raw_sub = unsafe { Box::from_raw(subtransport as *mut RawSmartSubtransport) };
    let entry = Bridge::global()
        .handles()
        .untrack(raw_sub.handle)
        .into_subtransport();
    entry.session().free();
    tracing::trace!(handle = %raw_sub.handle, "freed subtransport");
}

fn stream_entry(stream: *mut raw::git_smart_subtransport_stream) -> Arc<StreamEntry> {
    let raw_stream = stream as *mut RawSmartSubtransportStream;
    Bridge::global()
        .handles()
        .get(unsafe { (*raw_stream).handle })
        .into_stream()
}

extern "C" fn stream_read(
    stream: *mut raw::git_smart_subtransport_stream,
    buffer: *mut c_char,
    buf_size: size_t,
    bytes_read: *mut size_t,
) -> c_int {
    let entry = stream_entry(stream);
    let buf = unsafe { slice::from_raw_parts_mut(buffer as *mut u8, buf_size as usize) };
    match entry.stream.read(buf) {
        Ok(n) => {
            unsafe { *bytes_read = n as size_t };
            0
        }
        Err(err) => entry.owner.transport.fail(err),
    }
}

extern "C" fn stream_write(
    stream: *mut raw::git_smart_subtransport_stream,
    buffer: *const c_char,
    len: size_t,
) -> c_int {
    let entry = stream_entry(stream);
    let mut data = unsafe { slice::from_raw_parts(buffer as *const u8, len as usize) };
    while !data.is_empty() {
        match entry.stream.write(data) {
            Ok(0) => {
                let err = GitError::CustomError("stream accepted no bytes".to_string());
                return entry.owner.transport.fail(err);
            }
            Ok(n) => data = &data[n.min(data.len())..],
            Err(err) => return entry.owner.transport.fail(err),
        }
    }
    0
}

extern "C" fn stream_free(stream: *mut raw::git_smart_subtransport_stream) {
    let raw_stream = unsafe { Box::from_raw(stream as *mut RawSmartSubtransportStream) };
    let raw_sub = raw_stream.parent.subtransport as *mut RawSmartSubtransport;
    let entry = Bridge::global()
        .handles()
        .untrack(raw_stream.handle)
        .into_stream();
    entry.stream.free();
    entry.owner.session().release_stream(&entry.stream);
    unsafe {
        if (*raw_sub).stream == stream as *mut RawSmartSubtransportStream {
            (*raw_sub).stream = ptr::null_mut();
        }
    }
    tracing::trace!(handle = %raw_stream.handle, "freed stream");
}
