//! # weft: a unified server runtime
//!
//! One process, four entry surfaces, one event fabric: synchronous
//! HTTP/JSON routes, server-push streams, cron jobs, and remote polyglot
//! workers all observe the same publish/subscribe topics, run-scope
//! correlation, retry/health policies, and telemetry spans.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use weft::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::init(ServerConfig::default());
//!
//!     server.add_events(vec![SubscriptionConfig::local(
//!         "orders.created",
//!         "auditor",
//!         Arc::new(|data, ctx| Box::pin(async move {
//!             ctx.logger.log(weft::LogLevel::Info, "order observed", Some(&data));
//!             Ok(())
//!         })),
//!     )])?;
//!
//!     server.add_routes(vec![RouteConfig::api(
//!         RouteMethod::Post,
//!         "/orders",
//!         Arc::new(|req, ctx| Box::pin(async move {
//!             ctx.emit("orders.created", req.body.clone());
//!             Ok(Some(Reply::ok(json!({"accepted": true}))))
//!         })),
//!     ).emits(vec!["orders.created".into()])])?;
//!
//!     let addr = server.start().await?;
//!     tracing::info!(%addr, "listening");
//!     tokio::signal::ctrl_c().await?;
//!     server.stop(false).await;
//!     Ok(())
//! }
//! ```

mod config;
mod server;

pub use config::{BridgeSection, ConfigError, ServerConfig};
pub use server::{Server, ServerError};

pub use weft_bridge::{
    BridgeClient, BridgeServer, EndpointConfig, HandlerModule, ModuleCtx, RegistryEntry,
    ServiceRegistry,
};
pub use weft_bus::{
    system, Bus, DispatchMode, EmitArgs, Envelope, EventCtx, EventHandler, Operator,
    RemoteBinding, SubscriptionConfig, Topology, SYSTEM_TOPIC_PREFIX,
};
pub use weft_http::{
    Middleware, Reply, ResponseSchema, RouteConfig, RouteCtx, RouteHandler, RouteKind,
    RouteMethod, SseFormat, StreamHandle,
};
pub use weft_kv::{KvPath, KvStore, MemoryKv, RunHandle, RunRegistry};
pub use weft_observability::{
    init_tracing, LogLevel, Logger, Telemetry, TelemetryConfig, TraceContext, TracingLogger,
};
pub use weft_reactive::{watch, ConcurrencyMode, StateCell, WatchConfig};
pub use weft_scheduler::{CronConfig, CronCtx, CronHandler, CronOutcome, RetryPolicy, Scheduler};

pub mod prelude {
    //! Everything a typical host needs in scope.
    pub use crate::{
        CronConfig, CronOutcome, EmitArgs, Reply, RouteConfig, RouteKind, RouteMethod, Server,
        ServerConfig, SseFormat, StateCell, SubscriptionConfig, WatchConfig,
    };
}
