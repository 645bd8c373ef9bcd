/// Smart transports
///
/// Lets Rust code serve URL schemes for libgit2's smart protocol. A scheme
/// is registered with a [`SmartTransportFactory`]; libgit2 then drives the
/// [`SmartSubtransport`] and [`SmartSubtransportStream`] it builds through
/// native vtables. Built-in HTTP and SSH subtransports live alongside.
pub mod core;
pub mod http;
pub(crate) mod raw;
pub mod registry;
pub mod ssh;
pub mod state;
pub mod types;
pub mod utils;

// Re-export main interfaces
pub use core::{
    SmartSubtransport, SmartSubtransportStream, SmartTransportFactory, SubtransportResult,
    Transport,
};
pub use registry::{RegisteredSmartTransport, RegisteredTransport};
pub use types::*;
