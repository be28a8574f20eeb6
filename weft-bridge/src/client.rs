use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;
use weft_bus::{RemoteBinding, RemoteError, RemoteInvoker, RemoteReply, TlsSettings, ValueMap};

use crate::codec::{decode_map, encode_value};
use crate::proto::invoker_client::InvokerClient;
use crate::proto::InvokeRequest;
use crate::registry::{DiscoveryConfig, DiscoveredEntry, EndpointConfig, ResolvedEndpoint, ServiceRegistry};

/// Status codes that trigger failover to the next candidate endpoint.
pub const RETRYABLE_CODES: [Code; 4] = [
    Code::Unavailable,
    Code::DeadlineExceeded,
    Code::Cancelled,
    Code::Unknown,
];

/// Error type for bridge configuration and transport setup.
#[derive(Debug)]
pub enum BridgeError {
    Config(String),
    Transport(String),
    Io(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Config(msg) => write!(f, "bridge configuration error: {msg}"),
            BridgeError::Transport(msg) => write!(f, "bridge transport error: {msg}"),
            BridgeError::Io(msg) => write!(f, "bridge io error: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Client half of the bridge: dials registry endpoints, probes health,
/// refreshes discovery, and fails over across retryable codes.
///
/// One connected channel is cached per `(target, credential-digest)`
/// pair; equivalent TLS configurations share one credentials object via
/// the SHA-256 of their PEM material.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    registry: ServiceRegistry,
    channels: DashMap<String, Channel>,
    tls_cache: DashMap<String, ClientTlsConfig>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeClient {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                registry,
                channels: DashMap::new(),
                tls_cache: DashMap::new(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// Spawn the health probe and discovery refresh loops for every
    /// registry entry that configures them.
    pub fn start(&self) {
        for name in self.inner.registry.entry_names() {
            let Some(entry) = self.inner.registry.get(&name) else {
                continue;
            };
            if let Some(health) = entry.health {
                let client = self.clone();
                let name = name.clone();
                let cancel = self.inner.cancel.child_token();
                self.spawn(tokio::spawn(async move {
                    client.probe_loop(name, health.interval_ms, health.timeout_ms, cancel).await;
                }));
            }
            if let Some(DiscoveryConfig::File { path, interval_ms }) = entry.discover {
                let client = self.clone();
                let cancel = self.inner.cancel.child_token();
                self.spawn(tokio::spawn(async move {
                    client.discovery_loop(name, path, interval_ms, cancel).await;
                }));
            }
        }
    }

    fn spawn(&self, handle: JoinHandle<()>) {
        self.inner.tasks.lock().unwrap().push(handle);
    }

    /// Stop probes and discovery and drop cached channels.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.channels.clear();
    }

    async fn probe_loop(
        &self,
        name: String,
        interval_ms: u64,
        timeout_ms: u64,
        cancel: CancellationToken,
    ) {
        let interval = Duration::from_millis(interval_ms.max(1));
        let timeout = Duration::from_millis(timeout_ms.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            for ep in self.inner.registry.probe_targets(&name) {
                let ready = match self.build_endpoint(&ep) {
                    Ok((endpoint, _digest)) => {
                        matches!(tokio::time::timeout(timeout, endpoint.connect()).await, Ok(Ok(_)))
                    }
                    Err(e) => {
                        tracing::warn!(target = %ep.target, error = %e, "probe setup failed");
                        false
                    }
                };
                if ready {
                    self.inner.registry.mark_healthy(&ep.target);
                } else {
                    self.inner.registry.mark_unhealthy(&ep.target);
                }
            }
        }
    }

    async fn discovery_loop(
        &self,
        name: String,
        path: std::path::PathBuf,
        interval_ms: u64,
        cancel: CancellationToken,
    ) {
        let interval = Duration::from_millis(interval_ms.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Vec<DiscoveredEntry>>(&bytes) {
                    Ok(entries) => {
                        let endpoints: Vec<EndpointConfig> =
                            entries.into_iter().map(EndpointConfig::from).collect();
                        tracing::debug!(service = %name, count = endpoints.len(), "discovery refreshed");
                        self.inner.registry.set_discovered(&name, endpoints);
                    }
                    Err(e) => {
                        tracing::warn!(service = %name, path = %path.display(), error = %e, "discovery file is not a valid endpoint array");
                    }
                },
                Err(e) => {
                    tracing::warn!(service = %name, path = %path.display(), error = %e, "discovery file unreadable");
                }
            }
        }
    }

    /// TLS credentials for a settings block, cached by the SHA-256 of
    /// the concatenated CA+key+cert bytes.
    fn tls_config(&self, tls: &TlsSettings) -> Result<(String, ClientTlsConfig), BridgeError> {
        let read = |path: &Option<String>| -> Result<Vec<u8>, BridgeError> {
            match path {
                Some(p) => std::fs::read(p)
                    .map_err(|e| BridgeError::Io(format!("cannot read '{p}': {e}"))),
                None => Ok(Vec::new()),
            }
        };
        let ca = read(&tls.ca_file)?;
        let key = read(&tls.key_file)?;
        let cert = read(&tls.cert_file)?;

        let mut hasher = Sha256::new();
        hasher.update(&ca);
        hasher.update(&key);
        hasher.update(&cert);
        let digest = format!("{:x}", hasher.finalize());

        if let Some(cached) = self.inner.tls_cache.get(&digest) {
            return Ok((digest, cached.clone()));
        }
        let mut config = ClientTlsConfig::new();
        if !ca.is_empty() {
            config = config.ca_certificate(Certificate::from_pem(ca));
        }
        if !cert.is_empty() && !key.is_empty() {
            config = config.identity(Identity::from_pem(cert, key));
        }
        self.inner.tls_cache.insert(digest.clone(), config.clone());
        Ok((digest, config))
    }

    fn build_endpoint(&self, ep: &ResolvedEndpoint) -> Result<(Endpoint, String), BridgeError> {
        let (scheme, tls) = match &ep.tls {
            Some(tls) if !tls.insecure => {
                let (digest, config) = self.tls_config(tls)?;
                let host = ep.target.split(':').next().unwrap_or(&ep.target).to_string();
                ("https", Some((digest, config.domain_name(host))))
            }
            _ => ("http", None),
        };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", ep.target))
            .map_err(|e| BridgeError::Config(format!("bad target '{}': {e}", ep.target)))?
            .connect_timeout(Duration::from_secs(2));
        let digest = match tls {
            Some((digest, config)) => {
                endpoint = endpoint
                    .tls_config(config)
                    .map_err(|e| BridgeError::Config(e.to_string()))?;
                digest
            }
            None => "plaintext".to_string(),
        };
        Ok((endpoint, digest))
    }

    /// Return (or establish and cache) the channel for an endpoint.
    async fn channel_for(&self, ep: &ResolvedEndpoint) -> Result<Channel, BridgeError> {
        let (endpoint, digest) = self.build_endpoint(ep)?;
        let key = format!("{}|{digest}", ep.target);
        if let Some(channel) = self.inner.channels.get(&key) {
            return Ok(channel.clone());
        }
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| BridgeError::Transport(format!("connect to '{}': {e}", ep.target)))?;
        self.inner.channels.insert(key, channel.clone());
        Ok(channel)
    }

    fn evict_channel(&self, ep: &ResolvedEndpoint) {
        self.inner
            .channels
            .retain(|key, _| !key.starts_with(&format!("{}|", ep.target)));
    }

    async fn invoke_with_failover(
        &self,
        binding: &RemoteBinding,
        method: &str,
        input: ValueMap,
        meta: ValueMap,
    ) -> Result<RemoteReply, RemoteError> {
        let candidates = self.inner.registry.candidates(binding);
        if candidates.is_empty() {
            return Err(RemoteError {
                code: Code::Unavailable as i32,
                message: format!("no endpoints for service '{}'", binding.service),
                retryable: true,
            });
        }

        let correlation = uuid::Uuid::new_v4().to_string();
        let wire_input = crate::codec::encode_map(&input);
        let mut last: Option<RemoteError> = None;

        for ep in candidates {
            let channel = match self.channel_for(&ep).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::debug!(target = %ep.target, error = %e, "endpoint unreachable, failing over");
                    self.inner.registry.mark_failure(&ep.target);
                    last = Some(RemoteError {
                        code: Code::Unavailable as i32,
                        message: e.to_string(),
                        retryable: true,
                    });
                    continue;
                }
            };

            // Metadata precedence: endpoint-merged strings first, then
            // the call's own meta on top.
            let mut wire_meta = std::collections::HashMap::new();
            for (k, v) in &ep.metadata {
                wire_meta.insert(k.clone(), encode_value(&serde_json::Value::String(v.clone())));
            }
            for (k, v) in &meta {
                wire_meta.insert(k.clone(), encode_value(v));
            }

            let mut request = tonic::Request::new(InvokeRequest {
                handler_name: binding.handler.clone(),
                method: method.to_string(),
                correlation: correlation.clone(),
                meta: wire_meta,
                input: wire_input.clone(),
            });
            if let Some(ms) = ep.timeout_ms {
                request.set_timeout(Duration::from_millis(ms));
            }

            match InvokerClient::new(channel).invoke(request).await {
                Ok(response) => {
                    let response = response.into_inner();
                    let status = response.status.unwrap_or_default();
                    if status.code == 0 {
                        self.inner.registry.mark_healthy(&ep.target);
                        return Ok(RemoteReply {
                            output: decode_map(response.output),
                        });
                    }
                    // The worker answered with an application failure:
                    // failover would not help.
                    return Err(RemoteError {
                        code: status.code,
                        message: status.message,
                        retryable: false,
                    });
                }
                Err(status) if RETRYABLE_CODES.contains(&status.code()) => {
                    tracing::debug!(
                        target = %ep.target,
                        code = ?status.code(),
                        "retryable failure, marking endpoint and failing over"
                    );
                    self.inner.registry.mark_failure(&ep.target);
                    self.evict_channel(&ep);
                    last = Some(RemoteError {
                        code: status.code() as i32,
                        message: status.message().to_string(),
                        retryable: true,
                    });
                }
                Err(status) => {
                    return Err(RemoteError {
                        code: status.code() as i32,
                        message: status.message().to_string(),
                        retryable: false,
                    });
                }
            }
        }

        Err(last.unwrap_or_else(|| RemoteError {
            code: Code::Unavailable as i32,
            message: "all endpoints failed".to_string(),
            retryable: true,
        }))
    }
}

impl RemoteInvoker for BridgeClient {
    fn invoke(
        &self,
        binding: &RemoteBinding,
        method: &str,
        input: ValueMap,
        meta: ValueMap,
    ) -> BoxFuture<'static, Result<RemoteReply, RemoteError>> {
        let client = self.clone();
        let binding = binding.clone();
        let method = method.to_string();
        Box::pin(async move { client.invoke_with_failover(&binding, &method, input, meta).await })
    }
}
