//! # weft-kv: key-value contract, dotted paths, and run scopes
//!
//! This crate defines the **pure abstraction layer** for Weft's state:
//! the [`KvStore`] contract a host adapter implements, the [`KvPath`]
//! facade that layers dotted-path traversal over it, and the
//! [`RunRegistry`] that keeps one reference-counted record per logical
//! invocation alive for as long as work derived from it is in flight.
//!
//! Concrete durable backends are supplied by the host; [`MemoryKv`] is
//! the bundled in-process adapter used by tests and defaults.
//!
//! # Concurrency
//!
//! `KvPath` performs read-modify-write sequences against the root record
//! of a path. Adapters serialize individual operations, but a path write
//! on a *shared* root is not atomic across concurrent writers. Consumers
//! should keep per-run data keyed under distinct run ids, which is
//! exactly what [`RunRegistry`] does with its `__run__:<id>` records.

mod path;
mod run;
mod store;

pub use path::KvPath;
pub use run::{RunHandle, RunRegistry, RunToken, RUN_KEY_PREFIX};
pub use store::{KvError, KvStore, MemoryKv};

pub mod prelude {
    //! Re-exports of the most commonly used KV types.
    pub use crate::{KvPath, KvStore, MemoryKv, RunHandle, RunRegistry};
}
