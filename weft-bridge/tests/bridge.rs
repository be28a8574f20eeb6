use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use weft_bridge::proto::control_plane_client::ControlPlaneClient;
use weft_bridge::proto::{control_request, control_response, ControlRequest, KvGet, KvPut};
use weft_bridge::{
    encode_value, BridgeClient, BridgeServer, DiscoveryConfig, EndpointConfig, HandlerModule,
    HealthConfig, ModuleCtx, RegistryEntry, ServiceRegistry,
};
use weft_bus::{
    Bus, RemoteBinding, RemoteInvoker, SubscriptionConfig, ValueMap,
};
use weft_kv::{KvStore, MemoryKv, RunRegistry};
use weft_observability::{Telemetry, TracingLogger};

struct Host {
    bus: Bus,
    runs: RunRegistry,
    kv: MemoryKv,
    server: BridgeServer,
    addr: std::net::SocketAddr,
}

async fn start_host() -> Host {
    let kv = MemoryKv::new();
    let runs = RunRegistry::new(Arc::new(kv.clone()));
    let bus = Bus::new(
        runs.clone(),
        Arc::new(kv.clone()),
        Arc::new(TracingLogger),
        Telemetry::new(),
    );
    let server = BridgeServer::new(
        bus.clone(),
        runs.clone(),
        Arc::new(kv.clone()),
        Arc::new(TracingLogger),
    );
    let addr = server.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
    Host {
        bus,
        runs,
        kv,
        server,
        addr,
    }
}

struct EchoModule;

impl HandlerModule for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    fn invoke(
        &self,
        method: &str,
        input: ValueMap,
        _meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        let method = method.to_string();
        Box::pin(async move {
            let mut output = ValueMap::new();
            output.insert("method".into(), json!(method));
            output.insert("echo".into(), Value::Object(input));
            Ok(output)
        })
    }
}

struct HealthyModule;

impl HandlerModule for HealthyModule {
    fn name(&self) -> &str {
        "healthy-handler"
    }

    fn invoke(
        &self,
        _method: &str,
        _input: ValueMap,
        _meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        Box::pin(async move {
            let mut output = ValueMap::new();
            output.insert("ok".into(), json!(true));
            output.insert("source".into(), json!("healthy"));
            Ok(output)
        })
    }
}

struct FailingModule;

impl HandlerModule for FailingModule {
    fn name(&self) -> &str {
        "failing"
    }

    fn invoke(
        &self,
        _method: &str,
        _input: ValueMap,
        _meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        Box::pin(async move { Err("worker exploded".into()) })
    }
}

/// Module that exercises the full ctx surface: run-scope data, emits.
struct ScopedModule;

impl HandlerModule for ScopedModule {
    fn name(&self) -> &str {
        "scoped"
    }

    fn invoke(
        &self,
        _method: &str,
        _input: ValueMap,
        _meta: ValueMap,
        ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        Box::pin(async move {
            let run = ctx.run.clone().expect("caller passed a live run");
            run.set("worker.visited", json!(true)).await?;
            ctx.emit("worker.done", json!({"from": "scoped"}));
            let mut output = ValueMap::new();
            output.insert("run".into(), json!(run.id()));
            Ok(output)
        })
    }
}

fn single_endpoint_registry(name: &str, addr: std::net::SocketAddr) -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    registry.add(
        name,
        RegistryEntry {
            endpoints: vec![EndpointConfig::new(addr.to_string())],
            ..Default::default()
        },
    );
    registry
}

#[tokio::test]
async fn invoke_round_trips_through_the_wire() {
    let host = start_host().await;
    host.server.register_module(Arc::new(EchoModule));

    let client = BridgeClient::new(single_endpoint_registry("svc", host.addr));
    let mut input = ValueMap::new();
    input.insert("n".into(), json!(7));
    input.insert("tags".into(), json!(["a", "b"]));

    let reply = client
        .invoke(&RemoteBinding::new("svc", "echo"), "api", input, ValueMap::new())
        .await
        .unwrap();
    assert_eq!(reply.output["method"], json!("api"));
    assert_eq!(reply.output["echo"], json!({"n": 7, "tags": ["a", "b"]}));

    host.server.close().await;
}

#[tokio::test]
async fn unknown_handler_is_a_non_retryable_not_found() {
    let host = start_host().await;
    let client = BridgeClient::new(single_endpoint_registry("svc", host.addr));

    let err = client
        .invoke(
            &RemoteBinding::new("svc", "nope"),
            "api",
            ValueMap::new(),
            ValueMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, tonic::Code::NotFound as i32);
    assert!(!err.retryable);

    host.server.close().await;
}

#[tokio::test]
async fn module_failure_surfaces_as_internal() {
    let host = start_host().await;
    host.server.register_module(Arc::new(FailingModule));
    let client = BridgeClient::new(single_endpoint_registry("svc", host.addr));

    let err = client
        .invoke(
            &RemoteBinding::new("svc", "failing"),
            "api",
            ValueMap::new(),
            ValueMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, tonic::Code::Internal as i32);
    assert!(err.message.contains("worker exploded"));

    host.server.close().await;
}

#[tokio::test]
async fn failover_skips_dead_endpoint_and_marks_it() {
    let host = start_host().await;
    host.server.register_module(Arc::new(HealthyModule));

    let registry = ServiceRegistry::new();
    registry.add(
        "switchable",
        RegistryEntry {
            endpoints: vec![
                EndpointConfig::new("127.0.0.1:59998"),
                EndpointConfig::new(host.addr.to_string()),
            ],
            health: Some(HealthConfig {
                interval_ms: 150,
                timeout_ms: 150,
            }),
            ..Default::default()
        },
    );
    let client = BridgeClient::new(registry);
    client.start();

    let binding = RemoteBinding::new("switchable", "healthy-handler");
    let reply = client
        .invoke(&binding, "api", ValueMap::new(), ValueMap::new())
        .await
        .unwrap();
    assert_eq!(reply.output["ok"], json!(true));
    assert_eq!(reply.output["source"], json!("healthy"));

    // The failed call stamped the dead endpoint; within the backoff
    // window it is no longer offered.
    let candidates: Vec<String> = client
        .registry()
        .candidates(&binding)
        .into_iter()
        .map(|e| e.target)
        .collect();
    assert_eq!(candidates, vec![host.addr.to_string()]);

    // The prober also converges on the same verdict.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.registry().is_healthy("127.0.0.1:59998"), Some(false));
    assert_eq!(client.registry().is_healthy(&host.addr.to_string()), Some(true));

    // Subsequent invokes keep succeeding without the dead endpoint.
    let reply = client
        .invoke(&binding, "api", ValueMap::new(), ValueMap::new())
        .await
        .unwrap();
    assert_eq!(reply.output["source"], json!("healthy"));

    client.close().await;
    host.server.close().await;
}

#[tokio::test]
async fn file_discovery_refresh_switches_to_live_endpoint() {
    let host = start_host().await;
    host.server.register_module(Arc::new(EchoModule));

    let dir = tempfile::tempdir().unwrap();
    let discovery_path = dir.path().join("endpoints.json");
    std::fs::write(
        &discovery_path,
        r#"[{"target": "127.0.0.1:59997"}]"#,
    )
    .unwrap();

    let registry = ServiceRegistry::new();
    registry.add(
        "discovered",
        RegistryEntry {
            discover: Some(DiscoveryConfig::File {
                path: discovery_path.clone(),
                interval_ms: 100,
            }),
            ..Default::default()
        },
    );
    let client = BridgeClient::new(registry);
    client.start();

    // First pass discovers the dead endpoint.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let binding = RemoteBinding::new("discovered", "echo");
    assert!(client
        .invoke(&binding, "api", ValueMap::new(), ValueMap::new())
        .await
        .is_err());

    // Overwrite with the live endpoint; the next refresh replaces the
    // discovered list.
    std::fs::write(
        &discovery_path,
        format!(r#"["{}"]"#, host.addr),
    )
    .unwrap();

    let mut succeeded = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(125)).await;
        if client
            .invoke(&binding, "api", ValueMap::new(), ValueMap::new())
            .await
            .is_ok()
        {
            succeeded = true;
            break;
        }
    }
    assert!(succeeded, "discovery refresh never reached the live endpoint");

    client.close().await;
    host.server.close().await;
}

#[tokio::test]
async fn invoked_module_shares_run_scope_and_bus() {
    let host = start_host().await;
    host.server.register_module(Arc::new(ScopedModule));

    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    host.bus
        .subscribe(SubscriptionConfig::local(
            "worker.done",
            "watcher",
            Arc::new(move |_data, _ctx| {
                let o = o.clone();
                Box::pin(async move {
                    o.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        ))
        .unwrap();

    let run = host.runs.create().await.unwrap();
    let mut meta = ValueMap::new();
    meta.insert("run_id".into(), json!(run.id()));

    let client = BridgeClient::new(single_endpoint_registry("svc", host.addr));
    let reply = client
        .invoke(&RemoteBinding::new("svc", "scoped"), "api", ValueMap::new(), meta)
        .await
        .unwrap();
    assert_eq!(reply.output["run"], json!(run.id()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    // The module wrote into the caller's run scope on this host.
    assert_eq!(run.get("worker.visited").await, Some(json!(true)));

    run.release().await.unwrap();
    host.server.close().await;
}

/// Records the meta map it was invoked with.
struct MetaProbe {
    seen: Arc<tokio::sync::Mutex<Option<ValueMap>>>,
}

impl HandlerModule for MetaProbe {
    fn name(&self) -> &str {
        "meta-probe"
    }

    fn invoke(
        &self,
        _method: &str,
        _input: ValueMap,
        meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            *seen.lock().await = Some(meta);
            Ok(ValueMap::new())
        })
    }
}

#[tokio::test]
async fn merged_metadata_reaches_the_worker() {
    let host = start_host().await;
    let seen = Arc::new(tokio::sync::Mutex::new(None));
    host.server.register_module(Arc::new(MetaProbe { seen: seen.clone() }));

    let registry = ServiceRegistry::new();
    let mut entry = RegistryEntry {
        endpoints: vec![EndpointConfig::new(host.addr.to_string())],
        ..Default::default()
    };
    entry.metadata.insert("tier".into(), "registry".into());
    entry.metadata.insert("region".into(), "eu".into());
    registry.add("svc", entry);

    let mut binding = RemoteBinding::new("svc", "meta-probe");
    binding.metadata.insert("tier".into(), "binding".into());

    let mut call_meta = ValueMap::new();
    call_meta.insert("run_id".into(), json!("r-1"));

    let client = BridgeClient::new(registry);
    client
        .invoke(&binding, "api", ValueMap::new(), call_meta)
        .await
        .unwrap();

    let meta = seen.lock().await.clone().expect("module invoked");
    // binding > registry for static metadata; call meta rides along.
    assert_eq!(meta["tier"], json!("binding"));
    assert_eq!(meta["region"], json!("eu"));
    assert_eq!(meta["run_id"], json!("r-1"));

    host.server.close().await;
}

struct SlowModule;

impl HandlerModule for SlowModule {
    fn name(&self) -> &str {
        "slow"
    }

    fn invoke(
        &self,
        _method: &str,
        _input: ValueMap,
        _meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            Ok(ValueMap::new())
        })
    }
}

#[tokio::test]
async fn per_call_deadline_expires_as_retryable() {
    let host = start_host().await;
    host.server.register_module(Arc::new(SlowModule));

    let registry = single_endpoint_registry("svc", host.addr);
    let client = BridgeClient::new(registry);
    let mut binding = RemoteBinding::new("svc", "slow");
    binding.timeout_ms = Some(100);

    let started = std::time::Instant::now();
    let err = client
        .invoke(&binding, "api", ValueMap::new(), ValueMap::new())
        .await
        .unwrap_err();
    assert!(err.retryable, "deadline expiry should be retryable: {err}");
    assert!(
        started.elapsed() < Duration::from_millis(900),
        "call should not wait out the slow handler"
    );
    // The endpoint sits in its backoff window now.
    assert!(client
        .registry()
        .candidates(&binding)
        .iter()
        .all(|ep| ep.target == host.addr.to_string()));

    host.server.close().await;
}

#[tokio::test]
async fn control_plane_funnels_kv_log_and_emit_into_the_host() {
    let host = start_host().await;

    let emitted = Arc::new(AtomicUsize::new(0));
    let e = emitted.clone();
    host.bus
        .subscribe(SubscriptionConfig::local(
            "remote.event",
            "sink",
            Arc::new(move |data, _ctx| {
                let e = e.clone();
                Box::pin(async move {
                    assert_eq!(data, json!({"from": "worker"}));
                    e.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        ))
        .unwrap();

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{}", host.addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = ControlPlaneClient::new(channel);
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let mut responses = client
        .connect(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    // kv_put then kv_get under <bucket>:<key>.
    tx.send(ControlRequest {
        correlation: "c1".into(),
        meta: Default::default(),
        body: Some(control_request::Body::KvPut(KvPut {
            bucket: "jobs".into(),
            key: "last".into(),
            value: Some(encode_value(&json!({"id": 9}))),
        })),
    })
    .await
    .unwrap();
    let response = responses.message().await.unwrap().unwrap();
    assert_eq!(response.correlation, "c1");
    match response.body {
        Some(control_response::Body::KvCommonRes(res)) => assert!(res.ok),
        other => panic!("expected kv_common_res, got {other:?}"),
    }
    assert_eq!(
        host.kv.get("jobs:last").await.unwrap(),
        Some(json!({"id": 9}))
    );

    tx.send(ControlRequest {
        correlation: "c2".into(),
        meta: Default::default(),
        body: Some(control_request::Body::KvGet(KvGet {
            bucket: "jobs".into(),
            key: "last".into(),
        })),
    })
    .await
    .unwrap();
    let response = responses.message().await.unwrap().unwrap();
    assert_eq!(response.correlation, "c2");
    match response.body {
        Some(control_response::Body::KvGetRes(res)) => {
            assert!(res.found);
            assert_eq!(
                res.value.map(weft_bridge::decode_value),
                Some(json!({"id": 9}))
            );
        }
        other => panic!("expected kv_get_res, got {other:?}"),
    }

    // log and emit are fire-and-forget but still acknowledged.
    tx.send(ControlRequest {
        correlation: "c3".into(),
        meta: Default::default(),
        body: Some(control_request::Body::Log(weft_bridge::proto::LogMessage {
            level: "warn".into(),
            msg: "from worker".into(),
            fields: Default::default(),
        })),
    })
    .await
    .unwrap();
    assert_eq!(responses.message().await.unwrap().unwrap().correlation, "c3");

    tx.send(ControlRequest {
        correlation: "c4".into(),
        meta: Default::default(),
        body: Some(control_request::Body::Emit(weft_bridge::proto::EmitMessage {
            topic: "remote.event".into(),
            data: Some(encode_value(&json!({"from": "worker"}))),
        })),
    })
    .await
    .unwrap();
    assert_eq!(responses.message().await.unwrap().unwrap().correlation, "c4");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(emitted.load(Ordering::SeqCst), 1);

    drop(tx);
    host.server.close().await;
}
