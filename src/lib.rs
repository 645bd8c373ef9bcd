//! git-bridge: Rust-side smart transports and remote callbacks for libgit2.
//!
//! libgit2 calls into Rust through C function pointers and opaque payloads.
//! This crate keeps every object native code may refer to in a handle table
//! owned by the process-wide [`Bridge`], so a payload is an index and never a
//! raw Rust pointer.
//!
//! Core Capabilities
//! - Transports: register a [`SmartTransportFactory`] for a URL scheme; libgit2
//!   drives the [`SmartSubtransport`] and streams it builds.
//! - Managed HTTP and SSH: built-in subtransports on reqwest and russh, with
//!   credential and host-key checks routed to the owning remote.
//! - Remotes: [`RemoteCallbacks`] for credentials, certificates, progress and
//!   push updates; callback errors come back unchanged from the top-level call.
//!
//! Modules
//! - `bridge`: global state, transport registration, shutdown.
//! - `transport`: subtransport traits, stream state machine, native vtables,
//!   HTTP and SSH implementations.
//! - `remote`: remote handles and the callback bridge.
//! - `handles`: the handle table.
//! - `credentials` and `cert`: values exchanged with callbacks.
//! - `errors`: unified error types and native status mapping.
//!
//! Typical Usage
//! - `Bridge::init().register_transport("foo", true, factory)` and keep the
//!   returned token alive while the scheme should resolve.
//! - `repo.remote_anonymous(url)?.connect_fetch(callbacks)` then `ls()`.

pub mod bridge;
pub mod cert;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod handles;
pub mod hash;
pub mod remote;
pub mod repository;
pub mod transport;
pub mod utils;

pub use bridge::Bridge;
pub use cert::{Certificate, HostkeyCertificate, HostkeyKind};
pub use config::{BridgeConfig, HttpConfig, SshConfig};
pub use credentials::{Credential, CredentialType};
pub use errors::{ErrorClass, ErrorCode, GitError};
pub use remote::{Remote, RemoteCallbacks, RemoteHead, RemoteInfo};
pub use repository::Repository;
pub use transport::{
    Direction, RegisteredSmartTransport, ServiceType, SmartServiceAction, SmartSubtransport,
    SmartSubtransportStream, SmartTransportFactory, SubtransportResult, Transport,
};
