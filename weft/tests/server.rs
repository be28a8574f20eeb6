use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use weft::{
    system, BridgeServer, Bus, CronConfig, CronOutcome, EmitArgs, HandlerModule, MemoryKv,
    ModuleCtx, RegistryEntry, RemoteBinding, Reply, RetryPolicy, RouteConfig, RouteKind,
    RouteMethod, RunRegistry, Server, ServerConfig, SubscriptionConfig, TracingLogger,
};
use weft_bridge::EndpointConfig;
use weft_bus::ValueMap;
use weft_kv::{KvStore, RUN_KEY_PREFIX};

fn test_config() -> ServerConfig {
    ServerConfig::default().with_port(0)
}

/// Minimal HTTP/1.1 client: one request, `Connection: close`, full read.
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (u16, String, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8_lossy(&raw).into_owned();
    let (head, payload) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    // Undo chunked framing when present so assertions see the payload.
    let body = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        payload
            .split("\r\n")
            .enumerate()
            .filter_map(|(i, part)| (i % 2 == 1).then_some(part))
            .collect::<String>()
    } else {
        payload.to_string()
    };
    (status, head.to_string(), body)
}

#[tokio::test]
async fn start_fails_fast_on_one_sided_topics() {
    let server = Server::init(test_config());
    server
        .add_routes(vec![RouteConfig::api(
            RouteMethod::Post,
            "/orders",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Some(Reply::ok(json!(null)))) })),
        )
        .emits(vec!["orders.created".into()])])
        .unwrap();

    let err = server.start().await.unwrap_err();
    assert!(err.to_string().contains("orders.created"));
}

#[tokio::test]
async fn validation_can_be_disabled() {
    let server = Server::init(test_config().with_validate_events(false));
    server
        .add_routes(vec![RouteConfig::api(
            RouteMethod::Post,
            "/orders",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Some(Reply::ok(json!(null)))) })),
        )
        .emits(vec!["orders.created".into()])])
        .unwrap();

    server.start().await.unwrap();
    server.stop(false).await;
}

#[tokio::test]
async fn route_event_and_run_scope_flow_end_to_end() {
    let kv = MemoryKv::new();
    let server = Server::init_with(test_config(), Arc::new(kv.clone()), Arc::new(TracingLogger));

    let observed = Arc::new(tokio::sync::Mutex::new(None::<Value>));
    let o = observed.clone();
    server
        .add_events(vec![SubscriptionConfig::local(
            "audit.run",
            "auditor",
            Arc::new(move |_data, ctx| {
                let o = o.clone();
                Box::pin(async move {
                    let run = ctx.run.as_ref().expect("run scope");
                    *o.lock().await = run.get("request.id").await;
                    Ok(())
                })
            }),
        )])
        .unwrap();

    server
        .add_routes(vec![RouteConfig::api(
            RouteMethod::Get,
            "/run-id",
            Arc::new(|_req, ctx| {
                Box::pin(async move {
                    ctx.run.set("request.id", json!(ctx.run.id())).await?;
                    ctx.emit("audit.run", json!({}));
                    Ok(Some(Reply::ok(json!({"run": ctx.run.id()}))))
                })
            }),
        )
        .emits(vec!["audit.run".into()])])
        .unwrap();

    let addr = server.start().await.unwrap();
    let (status, _, body) = http_request(addr, "GET", "/run-id", None).await;
    assert_eq!(status, 200);
    let body: Value = serde_json::from_str(&body).unwrap();
    let run_id = body["run"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(observed.lock().await.clone(), Some(json!(run_id)));
    assert!(kv.keys(RUN_KEY_PREFIX).await.unwrap().is_empty());
    assert_eq!(server.runs().len(), 0);

    server.stop(false).await;
}

#[tokio::test]
async fn sse_stream_terminates_from_the_server_side() {
    let server = Server::init(test_config());
    server
        .add_routes(vec![RouteConfig::sse(
            RouteMethod::Get,
            "/events",
            Arc::new(|_req, ctx| {
                Box::pin(async move {
                    let stream = ctx.stream.as_ref().unwrap();
                    stream
                        .send(json!({"message": "hello"}), Default::default())
                        .unwrap();
                    Ok(None)
                })
            }),
        )
        .with_response_schema(weft::ResponseSchema::Global(json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        })))])
        .unwrap();

    let addr = server.start().await.unwrap();
    // read_to_end only returns because the adapter closed the stream and
    // the connection with it.
    let (status, head, body) = http_request(addr, "GET", "/events", None).await;
    assert_eq!(status, 200);
    assert!(head
        .to_ascii_lowercase()
        .contains("content-type: text/event-stream"));
    assert_eq!(body, "data: {\"message\":\"hello\"}\n\n");

    server.stop(false).await;
}

#[tokio::test]
async fn cron_job_runs_under_the_server() {
    let kv = MemoryKv::new();
    let server = Server::init_with(test_config(), Arc::new(kv.clone()), Arc::new(TracingLogger));

    let handler: weft_scheduler::CronHandler = Arc::new(|_now, ctx| {
        Box::pin(async move {
            let next = match ctx.kv.get("cron-custom-retry").await? {
                Some(v) => v.as_u64().unwrap_or(0) + 1,
                None => 1,
            };
            ctx.kv.put("cron-custom-retry", json!(next)).await?;
            if next == 1 {
                Ok(CronOutcome::RetryIn(5))
            } else {
                Ok(CronOutcome::Done)
            }
        })
    });
    server
        .add_crons(vec![CronConfig::new("custom-retry", "* * * * * *", handler)
            .with_retry(RetryPolicy {
                max_retries: 1,
                delay_ms: 10,
            })])
        .unwrap();

    server.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;
    server.stop(false).await;

    let stored = kv.get("cron-custom-retry").await.unwrap().unwrap();
    assert!(stored.as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn stop_publishes_shutdown_with_critical_flag() {
    let server = Server::init(test_config());
    let observed = Arc::new(tokio::sync::Mutex::new(None::<Value>));
    let o = observed.clone();
    server
        .add_events(vec![SubscriptionConfig::local(
            system::SHUTDOWN,
            "shutdown-hook",
            Arc::new(move |data, _ctx| {
                let o = o.clone();
                Box::pin(async move {
                    *o.lock().await = Some(data);
                    Ok(())
                })
            }),
        )])
        .unwrap();

    server.start().await.unwrap();
    server.stop(true).await;
    assert_eq!(
        observed.lock().await.clone(),
        Some(json!({"critical": true}))
    );
}

#[tokio::test]
async fn registration_after_start_is_a_lifecycle_error() {
    let server = Server::init(test_config());
    server.start().await.unwrap();
    let err = server
        .add_routes(vec![RouteConfig::api(
            RouteMethod::Get,
            "/late",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Some(Reply::ok(json!(null)))) })),
        )])
        .unwrap_err();
    assert!(err.to_string().contains("before start()"));
    server.stop(false).await;
}

#[tokio::test]
async fn topology_dot_lists_declared_edges() {
    let server = Server::init(test_config().with_validate_events(false));
    server
        .add_events(vec![SubscriptionConfig::local(
            "orders.created",
            "auditor",
            Arc::new(|_data, _ctx| Box::pin(async { Ok(()) })),
        )])
        .unwrap();
    let dot = server.topology_dot();
    assert!(dot.contains("\"orders.created\" -> \"event:auditor\""));
}

struct GreeterModule;

impl HandlerModule for GreeterModule {
    fn name(&self) -> &str {
        "greeter"
    }

    fn invoke(
        &self,
        _method: &str,
        input: ValueMap,
        _meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        Box::pin(async move {
            let name = input
                .get("body")
                .and_then(|b| b.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            let mut output = ValueMap::new();
            output.insert("body".into(), json!({"greeting": format!("hello {name}")}));
            output.insert("status".into(), json!(200));
            Ok(output)
        })
    }
}

#[tokio::test]
async fn remote_route_dispatches_through_the_bridge() {
    // Worker side: a standalone bridge server hosting the module.
    let worker_kv = MemoryKv::new();
    let worker_runs = RunRegistry::new(Arc::new(worker_kv.clone()));
    let worker_bus = Bus::new(
        worker_runs.clone(),
        Arc::new(worker_kv.clone()),
        Arc::new(TracingLogger),
        weft::Telemetry::new(),
    );
    let worker = BridgeServer::new(
        worker_bus,
        worker_runs,
        Arc::new(worker_kv),
        Arc::new(TracingLogger),
    );
    worker.register_module(Arc::new(GreeterModule));
    let worker_addr = worker.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // Host side: a route bound to the worker via the registry.
    let server = Server::init(test_config());
    server.add_registry(
        "workers",
        RegistryEntry {
            endpoints: vec![EndpointConfig::new(worker_addr.to_string())],
            ..Default::default()
        },
    );
    server
        .add_routes(vec![RouteConfig::remote(
            RouteMethod::Post,
            "/greet",
            RouteKind::Api,
            RemoteBinding::new("workers", "greeter"),
        )])
        .unwrap();

    let addr = server.start().await.unwrap();
    let (status, _, body) =
        http_request(addr, "POST", "/greet", Some(json!({"name": "weft"}))).await;
    assert_eq!(status, 200);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body, json!({"greeting": "hello weft"}));

    server.stop(false).await;
    worker.close().await;
}

#[tokio::test]
async fn remote_route_without_bridge_is_a_500() {
    let server = Server::init(test_config());
    server
        .add_routes(vec![RouteConfig::remote(
            RouteMethod::Get,
            "/orphan",
            RouteKind::Api,
            RemoteBinding::new("nowhere", "ghost"),
        )])
        .unwrap();

    let addr = server.start().await.unwrap();
    let (status, _, body) = http_request(addr, "GET", "/orphan", None).await;
    assert_eq!(status, 500);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "bridge_unavailable");

    server.stop(false).await;
}

/// Records every invocation so tests can assert on the wire contract.
struct RecordingModule {
    name: &'static str,
    seen: Arc<tokio::sync::Mutex<Vec<(String, ValueMap, ValueMap)>>>,
}

impl HandlerModule for RecordingModule {
    fn name(&self) -> &str {
        self.name
    }

    fn invoke(
        &self,
        method: &str,
        input: ValueMap,
        meta: ValueMap,
        _ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, weft_bus::BoxError>> {
        let seen = self.seen.clone();
        let method = method.to_string();
        Box::pin(async move {
            seen.lock().await.push((method, input, meta));
            Ok(ValueMap::new())
        })
    }
}

#[tokio::test]
async fn remote_subscription_invokes_worker_with_event_method() {
    let worker_kv = MemoryKv::new();
    let worker_runs = RunRegistry::new(Arc::new(worker_kv.clone()));
    let worker_bus = Bus::new(
        worker_runs.clone(),
        Arc::new(worker_kv.clone()),
        Arc::new(TracingLogger),
        weft::Telemetry::new(),
    );
    let worker = BridgeServer::new(
        worker_bus,
        worker_runs,
        Arc::new(worker_kv),
        Arc::new(TracingLogger),
    );
    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    worker.register_module(Arc::new(RecordingModule {
        name: "event-sink",
        seen: seen.clone(),
    }));
    let worker_addr = worker.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let server = Server::init(test_config().with_validate_events(false));
    server.add_registry(
        "workers",
        RegistryEntry {
            endpoints: vec![EndpointConfig::new(worker_addr.to_string())],
            ..Default::default()
        },
    );
    server
        .add_events(vec![SubscriptionConfig::remote(
            "orders.created",
            "relay",
            RemoteBinding::new("workers", "event-sink"),
        )])
        .unwrap();
    server.start().await.unwrap();

    let run = server.runs().create().await.unwrap();
    server.emit(
        EmitArgs::new("orders.created", json!({"sku": "x1"})).with_run(run.id()),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let seen = seen.lock().await;
    assert_eq!(seen.len(), 1);
    let (method, input, _meta) = &seen[0];
    assert_eq!(method, "event");
    assert_eq!(input["topic"], json!("orders.created"));
    assert_eq!(input["payload"], json!({"sku": "x1"}));
    assert_eq!(input["runId"], json!(run.id()));
    drop(seen);

    // The delivery settled, so the run is back to its creator's count.
    assert_eq!(server.runs().pending(run.id()), Some(1));
    run.release().await.unwrap();

    server.stop(false).await;
    worker.close().await;
}

#[tokio::test]
async fn strict_query_validation_rejects_with_422() {
    let server = Server::init(test_config());
    server
        .add_routes(vec![RouteConfig::api(
            RouteMethod::Get,
            "/search",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Some(Reply::ok(json!([])))) })),
        )
        .with_query_schema(json!({
            "type": "object",
            "properties": {"q": {"type": "string", "minLength": 1}},
            "required": ["q"]
        }))
        .strict(true)])
        .unwrap();

    let addr = server.start().await.unwrap();
    let (status, _, body) = http_request(addr, "GET", "/search", None).await;
    assert_eq!(status, 422);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "validation_failed");

    let (status, _, _) = http_request(addr, "GET", "/search?q=weft", None).await;
    assert_eq!(status, 200);

    server.stop(false).await;
}

#[tokio::test]
async fn server_emit_reaches_subscribers() {
    let server = Server::init(test_config().with_validate_events(false));
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    server
        .add_events(vec![SubscriptionConfig::local(
            "direct.topic",
            "sink",
            Arc::new(move |_data, _ctx| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )])
        .unwrap();
    server.start().await.unwrap();

    server.emit(EmitArgs::new("direct.topic", json!({"n": 1})));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    server.stop(false).await;
}
