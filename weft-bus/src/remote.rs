use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

/// String-keyed JSON map, the shape of RPC `input` and `meta` payloads.
pub type ValueMap = serde_json::Map<String, Value>;

/// Per-route/event configuration for invoking a remote handler.
///
/// `service` names a registry entry; `handler` names the module on the
/// worker. The optional fields override registry and endpoint defaults
/// (binding > endpoint > registry).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBinding {
    pub service: String,
    pub handler: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl RemoteBinding {
    pub fn new(service: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            timeout_ms: None,
            backoff_ms: None,
            metadata: HashMap::new(),
            tls: None,
        }
    }
}

/// TLS material for one endpoint or binding.
///
/// `insecure` short-circuits to plaintext; otherwise the PEM files are
/// loaded and cached by content digest so equivalent configurations
/// share one credentials object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

/// Output of a successful remote invocation.
#[derive(Debug, Clone, Default)]
pub struct RemoteReply {
    pub output: ValueMap,
}

/// Failure of a remote invocation, after failover was exhausted.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// gRPC status code, as an integer to keep this crate transport-free.
    pub code: i32,
    pub message: String,
    /// Whether the bridge classified the final code as retryable.
    pub retryable: bool,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote invocation failed (code {}): {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl RemoteError {
    /// A bridge was never configured for this server.
    pub fn not_initialized() -> Self {
        Self {
            code: 0,
            message: "bridge is not initialised".to_string(),
            retryable: false,
        }
    }
}

/// The bus- and router-facing face of the bridge.
///
/// Kept as a trait here so the bus does not depend on the transport
/// crate; the bridge implements it and the server wires it in.
pub trait RemoteInvoker: Send + Sync {
    fn invoke(
        &self,
        binding: &RemoteBinding,
        method: &str,
        input: ValueMap,
        meta: ValueMap,
    ) -> BoxFuture<'static, Result<RemoteReply, RemoteError>>;
}
