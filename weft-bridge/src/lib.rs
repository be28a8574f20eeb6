//! RPC bridge for Weft.
//!
//! Two halves share one wire protocol (`proto/bridge.proto`, package
//! `bridge`):
//!
//! - [`BridgeClient`] dials configured registry endpoints and invokes
//!   remote handlers, with health probing, per-endpoint failure backoff,
//!   file-based discovery refresh, TLS credential caching, and failover
//!   across retryable status codes.
//! - [`BridgeServer`] exposes the `Invoker` service for registered local
//!   [`HandlerModule`]s and the `ControlPlane` service that surfaces the
//!   host's logger, bus, and key-value store to remote handlers.
//!
//! Payloads cross the wire as a tagged [`proto::Value`] union; the codec
//! in this crate picks the narrowest faithful tag.

pub mod proto {
    tonic::include_proto!("bridge");
}

mod client;
mod codec;
mod modules;
mod registry;
mod server;

pub use client::{BridgeClient, BridgeError, RETRYABLE_CODES};
pub use codec::{decode_map, decode_value, encode_map, encode_value};
pub use modules::{HandlerModule, ModuleCtx};
pub use registry::{
    DiscoveredEntry, DiscoveryConfig, EndpointConfig, HealthConfig, RegistryEntry,
    ResolvedEndpoint, ServiceRegistry,
};
pub use server::BridgeServer;

pub mod prelude {
    //! Re-exports of the most commonly used bridge types.
    pub use crate::{BridgeClient, BridgeServer, HandlerModule, RegistryEntry, ServiceRegistry};
}
