//! Route dispatcher for Weft.
//!
//! Adapts inbound HTTP requests onto the common handler contract: every
//! route gets a run scope, a request span, schema validation on the way
//! in and out, and an `emit` pre-bound to both. Handlers may be local
//! closures, remote workers behind the bridge, or a single static file.
//! Streaming routes hand the handler a [`StreamHandle`] that frames
//! server-push payloads as SSE events or NDJSON lines.

mod dispatch;
mod error;
mod middleware;
mod route;
mod stream;

pub use dispatch::{HttpRouter, RouterDeps, RouterError};
pub use error::{validation_error_body, ErrorBody};
pub use middleware::Middleware;
pub use route::{
    Reply, ResponseSchema, RouteConfig, RouteCtx, RouteHandler, RouteKind, RouteMethod,
    RouteRequest, RouteTarget,
};
pub use stream::{SendOptions, SseFormat, StreamError, StreamHandle};

pub mod prelude {
    //! Re-exports of the most commonly used router types.
    pub use crate::{
        HttpRouter, Reply, RouteConfig, RouteCtx, RouteKind, RouteMethod, RouteRequest,
        SseFormat, StreamHandle,
    };
}
