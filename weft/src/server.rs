use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weft_bridge::{BridgeClient, BridgeError, BridgeServer, HandlerModule, RegistryEntry, ServiceRegistry};
use weft_bus::{system, Bus, BusError, EmitArgs, SubscriptionConfig, Topology, TopologyError};
use weft_http::{HttpRouter, RouteConfig, RouterDeps, RouterError};
use weft_kv::{KvPath, KvStore, MemoryKv, RunRegistry};
use weft_observability::{Logger, Telemetry, TracingLogger};
use weft_reactive::{watch as attach_watch, StateCell, WatchConfig, WatchDeps, WatchHandle};
use weft_scheduler::{CronConfig, Scheduler, SchedulerError};

use crate::config::ServerConfig;

/// Error type for server lifecycle and registration.
#[derive(Debug)]
pub enum ServerError {
    Lifecycle(String),
    Topology(TopologyError),
    Router(RouterError),
    Scheduler(SchedulerError),
    Bus(BusError),
    Bridge(BridgeError),
    Io(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Lifecycle(msg) => write!(f, "lifecycle error: {msg}"),
            ServerError::Topology(e) => write!(f, "{e}"),
            ServerError::Router(e) => write!(f, "{e}"),
            ServerError::Scheduler(e) => write!(f, "{e}"),
            ServerError::Bus(e) => write!(f, "{e}"),
            ServerError::Bridge(e) => write!(f, "{e}"),
            ServerError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<TopologyError> for ServerError {
    fn from(e: TopologyError) -> Self {
        ServerError::Topology(e)
    }
}

impl From<RouterError> for ServerError {
    fn from(e: RouterError) -> Self {
        ServerError::Router(e)
    }
}

impl From<SchedulerError> for ServerError {
    fn from(e: SchedulerError) -> Self {
        ServerError::Scheduler(e)
    }
}

impl From<BusError> for ServerError {
    fn from(e: BusError) -> Self {
        ServerError::Bus(e)
    }
}

impl From<BridgeError> for ServerError {
    fn from(e: BridgeError) -> Self {
        ServerError::Bridge(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// The server: one instance owning bus, KV facade, run registry, router,
/// scheduler, bridge, and telemetry as injected sub-services.
///
/// Registration (`add_routes`, `add_events`, `add_crons`, `watch`, …)
/// happens between [`Server::init`] and [`Server::start`]; `start`
/// validates the declared event topology, binds the HTTP listener, and
/// arms cron jobs, bridge server, health probes, and discovery.
/// [`Server::stop`] publishes `SYS::SHUTDOWN` and closes the subsystems
/// in order.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    kv: Arc<dyn KvStore>,
    kv_path: KvPath,
    logger: Arc<dyn Logger>,
    telemetry: Telemetry,
    runs: RunRegistry,
    bus: Bus,
    scheduler: Scheduler,
    topology: Topology,
    router: Mutex<HttpRouter>,
    crons: Mutex<Vec<CronConfig>>,
    watches: Mutex<Vec<WatchHandle>>,
    bridge_server: BridgeServer,
    bridge_client: BridgeClient,
    state: Mutex<Lifecycle>,
    http_cancel: CancellationToken,
    http_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Construct with the bundled in-memory KV and tracing logger.
    pub fn init(config: ServerConfig) -> Self {
        Self::init_with(config, Arc::new(MemoryKv::new()), Arc::new(TracingLogger))
    }

    /// Construct with host-supplied KV and logger adapters.
    pub fn init_with(
        config: ServerConfig,
        kv: Arc<dyn KvStore>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let telemetry = Telemetry::new();
        let runs = RunRegistry::new(Arc::clone(&kv));
        let bus = Bus::new(
            runs.clone(),
            Arc::clone(&kv),
            Arc::clone(&logger),
            telemetry.clone(),
        );
        let scheduler = Scheduler::new(
            bus.clone(),
            runs.clone(),
            Arc::clone(&kv),
            Arc::clone(&logger),
            telemetry.clone(),
        );
        let registry = ServiceRegistry::new();
        for (name, entry) in &config.bridge.registry {
            registry.add(name.clone(), entry.clone());
        }
        let bridge_client = BridgeClient::new(registry);
        let bridge_server = BridgeServer::new(
            bus.clone(),
            runs.clone(),
            Arc::clone(&kv),
            Arc::clone(&logger),
        );
        Self {
            inner: Arc::new(ServerInner {
                kv_path: KvPath::new(Arc::clone(&kv)),
                kv,
                logger,
                telemetry,
                runs,
                bus,
                scheduler,
                topology: Topology::new(),
                router: Mutex::new(HttpRouter::new()),
                crons: Mutex::new(Vec::new()),
                watches: Mutex::new(Vec::new()),
                bridge_server,
                bridge_client,
                state: Mutex::new(Lifecycle::Created),
                http_cancel: CancellationToken::new(),
                http_task: Mutex::new(None),
                local_addr: Mutex::new(None),
                config,
            }),
        }
    }

    fn ensure_created(&self, what: &str) -> Result<(), ServerError> {
        let state = *self.inner.state.lock().unwrap();
        if state == Lifecycle::Created {
            Ok(())
        } else {
            Err(ServerError::Lifecycle(format!(
                "{what} must happen before start() (state: {state:?})"
            )))
        }
    }

    // ── Registration ──────────────────────────────────────────────────

    pub fn add_routes(&self, routes: Vec<RouteConfig>) -> Result<(), ServerError> {
        self.ensure_created("add_routes")?;
        let mut router = self.inner.router.lock().unwrap();
        for route in routes {
            let origin = format!("route:{}", route.label());
            for topic in &route.emits {
                self.inner.topology.declare_emit(&origin, topic);
            }
            router.add(route)?;
        }
        Ok(())
    }

    pub fn add_events(&self, subscriptions: Vec<SubscriptionConfig>) -> Result<(), ServerError> {
        self.ensure_created("add_events")?;
        for subscription in subscriptions {
            let origin = format!("event:{}", subscription.name);
            for topic in &subscription.topics {
                self.inner.topology.declare_subscribe(&origin, topic);
            }
            for topic in &subscription.emits {
                self.inner.topology.declare_emit(&origin, topic);
            }
            self.inner.bus.subscribe(subscription)?;
        }
        Ok(())
    }

    pub fn add_crons(&self, crons: Vec<CronConfig>) -> Result<(), ServerError> {
        self.ensure_created("add_crons")?;
        let mut stored = self.inner.crons.lock().unwrap();
        for cron in crons {
            let origin = format!("cron:{}", cron.name);
            for topic in &cron.emits {
                self.inner.topology.declare_emit(&origin, topic);
            }
            stored.push(cron);
        }
        Ok(())
    }

    /// Register a named registry entry for outbound bridge invocation.
    pub fn add_registry(&self, name: impl Into<String>, entry: RegistryEntry) {
        self.inner.bridge_client.registry().add(name, entry);
    }

    /// Register a local handler module served on the bridge's `Invoker`
    /// service.
    pub fn register_handler_module(&self, module: Arc<dyn HandlerModule>) {
        self.inner.bridge_server.register_module(module);
    }

    /// Attach a reactive watcher to a state cell.
    pub fn watch<T>(&self, cell: &StateCell<T>, config: WatchConfig) -> Result<(), ServerError>
    where
        T: Clone + Serialize + Send + 'static,
    {
        self.ensure_created("watch")?;
        let origin = format!("reactive:{}", config.name);
        for topic in &config.emits {
            self.inner.topology.declare_emit(&origin, topic);
        }
        let deps = WatchDeps {
            bus: self.inner.bus.clone(),
            runs: self.inner.runs.clone(),
            kv: Arc::clone(&self.inner.kv),
            logger: Arc::clone(&self.inner.logger),
            telemetry: self.inner.telemetry.clone(),
        };
        let handle = attach_watch(cell, config, deps);
        self.inner.watches.lock().unwrap().push(handle);
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.inner.kv
    }

    pub fn kv_path(&self) -> &KvPath {
        &self.inner.kv_path
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.inner.runs
    }

    pub fn registry(&self) -> &ServiceRegistry {
        self.inner.bridge_client.registry()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }

    /// Bound HTTP address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Publish on the bus directly (outside any handler context).
    pub fn emit(&self, args: EmitArgs) {
        self.inner.bus.emit(args);
    }

    /// DOT rendering of the declared emit/subscribe graph.
    pub fn topology_dot(&self) -> String {
        self.inner.topology.to_dot()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Validate the topology, bind HTTP, arm crons, and start the
    /// bridge. Returns the bound HTTP address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        self.ensure_created("start")?;

        if self.inner.config.validate_events {
            self.inner.topology.validate()?;
        }

        // The bridge becomes invokable only once the server starts; a
        // remote call before this point is a lifecycle error surfaced by
        // the bus/router.
        if !self.inner.bridge_client.registry().entry_names().is_empty() {
            self.inner
                .bus
                .set_remote_invoker(Arc::new(self.inner.bridge_client.clone()));
        }

        let deps = RouterDeps {
            bus: self.inner.bus.clone(),
            runs: self.inner.runs.clone(),
            kv: Arc::clone(&self.inner.kv),
            logger: Arc::clone(&self.inner.logger),
            telemetry: self.inner.telemetry.clone(),
            server_address: self.inner.config.host.clone(),
            server_port: self.inner.config.port,
        };
        let router = self.inner.router.lock().unwrap().build(deps)?;

        let listener = tokio::net::TcpListener::bind((
            self.inner.config.host.as_str(),
            self.inner.config.port,
        ))
        .await
        .map_err(|e| ServerError::Io(format!("bind {}:{}: {e}", self.inner.config.host, self.inner.config.port)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))?;
        *self.inner.local_addr.lock().unwrap() = Some(local_addr);

        let cancel = self.inner.http_cancel.clone();
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned());
        let task = tokio::spawn(async move {
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "http server terminated");
            }
        });
        *self.inner.http_task.lock().unwrap() = Some(task);

        for cron in std::mem::take(&mut *self.inner.crons.lock().unwrap()) {
            self.inner.scheduler.add(cron)?;
        }

        if let Some(listen) = &self.inner.config.bridge.listen {
            let addr: SocketAddr = listen
                .parse()
                .map_err(|e| ServerError::Io(format!("bad bridge listen address '{listen}': {e}")))?;
            self.inner.bridge_server.serve(addr).await?;
        }
        self.inner.bridge_client.start();

        *self.inner.state.lock().unwrap() = Lifecycle::Started;
        tracing::info!(%local_addr, "server started");
        Ok(local_addr)
    }

    /// Publish `SYS::SHUTDOWN {critical}`, then close Bus, Router
    /// (watchers), Cron, Bridge, and the HTTP server in order. Each
    /// subsystem's failure to close is logged, never propagated.
    pub async fn stop(&self, critical: bool) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == Lifecycle::Stopped {
                return;
            }
            *state = Lifecycle::Stopped;
        }
        tracing::info!(critical, "server stopping");

        self.inner
            .bus
            .emit(EmitArgs::new(system::SHUTDOWN, json!({ "critical": critical })));
        self.inner.bus.close().await;

        let watches = std::mem::take(&mut *self.inner.watches.lock().unwrap());
        for watch in watches {
            watch.close().await;
        }

        self.inner.scheduler.close().await;
        self.inner.bridge_client.close().await;
        self.inner.bridge_server.close().await;

        self.inner.http_cancel.cancel();
        let task = self.inner.http_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "http server task did not settle cleanly");
            }
        }
        tracing::info!("server stopped");
    }
}
