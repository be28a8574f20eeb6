//! In-process topic bus for Weft.
//!
//! Topics are string-named multicast streams: a publish on a topic is
//! delivered to every subscription registered for it, each through its
//! own channel, so per-topic per-subscription ordering matches
//! publication order. A subscription may interpose an operator pipeline
//! between publication and its handler, constrain payloads with a JSON
//! schema, and run its handler locally or on a remote worker via the
//! bridge.
//!
//! Envelopes carry the payload plus two pieces of ambient context: the
//! run scope of the originating invocation (reference-counted across the
//! fan-out) and the trace context of the emitting span (linked, not
//! parented, by the delivery span).

mod bus;
mod envelope;
mod operators;
mod remote;
pub mod schema;
mod subscription;
mod topology;

pub use bus::{Bus, BusError};
pub use envelope::{EmitArgs, Envelope};
pub use operators::{pipe, Delay, EnvelopeStream, Filter, MapData, Operator, Tap};
pub use remote::{
    RemoteBinding, RemoteError, RemoteInvoker, RemoteReply, TlsSettings, ValueMap,
};
pub use schema::{GateDecision, SchemaError, SchemaGate};
pub use subscription::{
    BoxError, DispatchMode, EventCtx, EventHandler, SubscriberKind, SubscriptionConfig,
};
pub use topology::{Direction, Topology, TopologyError};

/// Reserved prefix for system topics; excluded from topology validation.
pub const SYSTEM_TOPIC_PREFIX: &str = "SYS::";

/// Well-known system topics published by the runtime itself.
pub mod system {
    /// Published by `stop(critical)` before subsystems close. Payload
    /// `{"critical": bool}`.
    pub const SHUTDOWN: &str = "SYS::SHUTDOWN";
    /// A synchronous failure escaped a handler boundary. Payload
    /// `{"reason": string}`.
    pub const UNCAUGHT_EXCEPTION: &str = "SYS:::UNCAUGHT_EXCEPTION";
    /// An async handler task panicked. Payload `{"reason": string}`.
    pub const UNHANDLED_REJECTION: &str = "SYS:::UNHANDLED_REJECTION";
}

pub mod prelude {
    //! Re-exports of the most commonly used bus types.
    pub use crate::{
        Bus, DispatchMode, EmitArgs, Envelope, EventCtx, SubscriptionConfig, Topology,
    };
}
