//! Reactive state for Weft.
//!
//! [`StateCell`] holds a mutable state value whose mutations are applied
//! through [`StateCell::update`]. Commits coalesce: however many
//! mutations land before the commit task runs, subscribers receive
//! exactly one `(next, prev)` notification per batch, both sides deep
//! snapshots taken at commit time.
//!
//! [`watch`] turns a cell into a handler pipeline: seed with the current
//! value, select, pair consecutive values, filter (default: the selected
//! value changed), map into a bus envelope, pipe through operators, and
//! dispatch under one of four concurrency strategies.

mod cell;
mod watch;

pub use cell::{Change, StateCell};
pub use watch::{
    watch, ConcurrencyMode, WatchChange, WatchConfig, WatchCtx, WatchDeps, WatchHandle,
    WatchHandler,
};

pub mod prelude {
    //! Re-exports of the most commonly used reactive types.
    pub use crate::{watch, ConcurrencyMode, StateCell, WatchConfig};
}
