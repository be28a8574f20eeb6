use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use weft_bus::{RemoteBinding, TlsSettings};

/// Default failure backoff window when none is configured.
pub const DEFAULT_BACKOFF_MS: u64 = 30_000;

fn default_interval_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    1_000
}

/// Named bundle of endpoints and defaults for a logical remote service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryEntry {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub health: Option<HealthConfig>,
    #[serde(default)]
    pub discover: Option<DiscoveryConfig>,
}

/// One dialable endpoint within a registry entry.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// `host:port`.
    pub target: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl EndpointConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            metadata: HashMap::new(),
            timeout_ms: None,
            backoff_ms: None,
            tls: None,
        }
    }
}

/// Periodic ready-check configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Endpoint discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    /// Re-read a JSON array of endpoints from a file on an interval.
    File {
        path: PathBuf,
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
    },
}

/// One entry of a discovery file: `"host:port"` or an object with
/// overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DiscoveredEntry {
    Target(String),
    Full {
        target: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
        #[serde(default, rename = "timeoutMs")]
        timeout_ms: Option<u64>,
        #[serde(default, rename = "backoffMs")]
        backoff_ms: Option<u64>,
    },
}

impl From<DiscoveredEntry> for EndpointConfig {
    fn from(entry: DiscoveredEntry) -> Self {
        match entry {
            DiscoveredEntry::Target(target) => EndpointConfig::new(target),
            DiscoveredEntry::Full {
                target,
                metadata,
                timeout_ms,
                backoff_ms,
            } => EndpointConfig {
                target,
                metadata,
                timeout_ms,
                backoff_ms,
                tls: None,
            },
        }
    }
}

/// An endpoint after merging registry, discovery, endpoint, and binding
/// layers (binding > endpoint > registry).
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub target: String,
    pub metadata: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub backoff_ms: u64,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Copy)]
struct HealthMark {
    healthy: bool,
    changed_at: Instant,
}

/// Shared runtime state of the client side: configured entries,
/// discovered endpoints, health marks, and failure backoff stamps.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    entries: std::sync::Arc<DashMap<String, RegistryEntry>>,
    discovered: std::sync::Arc<DashMap<String, Vec<EndpointConfig>>>,
    health: std::sync::Arc<DashMap<String, HealthMark>>,
    failures: std::sync::Arc<DashMap<String, Instant>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, entry: RegistryEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Replace the discovered endpoint list for an entry.
    pub fn set_discovered(&self, name: impl Into<String>, endpoints: Vec<EndpointConfig>) {
        self.discovered.insert(name.into(), endpoints);
    }

    pub fn discovered(&self, name: &str) -> Vec<EndpointConfig> {
        self.discovered
            .get(name)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn mark_healthy(&self, target: &str) {
        let was_unhealthy = self
            .health
            .get(target)
            .map(|m| !m.healthy)
            .unwrap_or(false);
        if was_unhealthy {
            tracing::info!(%target, "endpoint recovered");
        }
        self.health.insert(
            target.to_string(),
            HealthMark {
                healthy: true,
                changed_at: Instant::now(),
            },
        );
        self.failures.remove(target);
    }

    pub fn mark_unhealthy(&self, target: &str) {
        let was_healthy = self
            .health
            .get(target)
            .map(|m| m.healthy)
            .unwrap_or(true);
        if was_healthy {
            tracing::warn!(%target, "endpoint marked unhealthy");
        }
        self.health.insert(
            target.to_string(),
            HealthMark {
                healthy: false,
                changed_at: Instant::now(),
            },
        );
    }

    /// `None` when the endpoint was never probed.
    pub fn is_healthy(&self, target: &str) -> Option<bool> {
        self.health.get(target).map(|m| m.healthy)
    }

    /// Stamp a failed call so the endpoint sits out its backoff window.
    pub fn mark_failure(&self, target: &str) {
        self.failures.insert(target.to_string(), Instant::now());
    }

    fn in_backoff(&self, target: &str, backoff_ms: u64) -> bool {
        self.failures
            .get(target)
            .map(|at| at.elapsed() < Duration::from_millis(backoff_ms))
            .unwrap_or(false)
    }

    /// All targets currently known for an entry (static + discovered),
    /// for the health prober.
    pub fn probe_targets(&self, name: &str) -> Vec<ResolvedEndpoint> {
        let Some(entry) = self.get(name) else {
            return Vec::new();
        };
        let binding = RemoteBinding::new(name, "");
        self.merge_candidates(&entry, &binding, name)
    }

    /// Candidate endpoints for one invocation, in preference order:
    /// healthy (and out of backoff) first; when none qualify, every
    /// endpoint is eligible so a fully-failed entry still gets retried.
    pub fn candidates(&self, binding: &RemoteBinding) -> Vec<ResolvedEndpoint> {
        let Some(entry) = self.get(&binding.service) else {
            return Vec::new();
        };
        let all = self.merge_candidates(&entry, binding, &binding.service);
        let preferred: Vec<ResolvedEndpoint> = all
            .iter()
            .filter(|ep| {
                self.is_healthy(&ep.target).unwrap_or(true)
                    && !self.in_backoff(&ep.target, ep.backoff_ms)
            })
            .cloned()
            .collect();
        if preferred.is_empty() {
            all
        } else {
            preferred
        }
    }

    fn merge_candidates(
        &self,
        entry: &RegistryEntry,
        binding: &RemoteBinding,
        name: &str,
    ) -> Vec<ResolvedEndpoint> {
        let mut endpoints = entry.endpoints.clone();
        endpoints.extend(self.discovered(name));
        endpoints
            .into_iter()
            .map(|ep| {
                let mut metadata = entry.metadata.clone();
                metadata.extend(ep.metadata.clone());
                metadata.extend(binding.metadata.clone());
                ResolvedEndpoint {
                    target: ep.target,
                    metadata,
                    timeout_ms: binding
                        .timeout_ms
                        .or(ep.timeout_ms)
                        .or(entry.timeout_ms),
                    backoff_ms: binding
                        .backoff_ms
                        .or(ep.backoff_ms)
                        .or(entry.backoff_ms)
                        .unwrap_or(DEFAULT_BACKOFF_MS),
                    tls: binding.tls.clone().or(ep.tls).or(entry.tls.clone()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(targets: &[&str]) -> RegistryEntry {
        RegistryEntry {
            endpoints: targets.iter().map(|t| EndpointConfig::new(*t)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn candidates_preserve_declaration_order() {
        let registry = ServiceRegistry::new();
        registry.add("svc", entry_with(&["a:1", "b:2"]));
        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["a:1", "b:2"]);
    }

    #[test]
    fn discovered_endpoints_append_to_static() {
        let registry = ServiceRegistry::new();
        registry.add("svc", entry_with(&["a:1"]));
        registry.set_discovered("svc", vec![EndpointConfig::new("d:9")]);
        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["a:1", "d:9"]);

        // A refresh replaces, not appends.
        registry.set_discovered("svc", vec![EndpointConfig::new("d2:9")]);
        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["a:1", "d2:9"]);
    }

    #[test]
    fn metadata_precedence_binding_over_endpoint_over_registry() {
        let registry = ServiceRegistry::new();
        let mut entry = entry_with(&["a:1"]);
        entry.metadata.insert("tier".into(), "registry".into());
        entry.metadata.insert("region".into(), "registry".into());
        entry.endpoints[0]
            .metadata
            .insert("tier".into(), "endpoint".into());
        registry.add("svc", entry);

        let mut binding = RemoteBinding::new("svc", "h");
        binding.metadata.insert("region".into(), "binding".into());

        let resolved = registry.candidates(&binding);
        assert_eq!(resolved[0].metadata["tier"], "endpoint");
        assert_eq!(resolved[0].metadata["region"], "binding");
    }

    #[test]
    fn timeout_and_backoff_resolution() {
        let registry = ServiceRegistry::new();
        let mut entry = entry_with(&["a:1", "b:2"]);
        entry.timeout_ms = Some(500);
        entry.endpoints[1].timeout_ms = Some(250);
        registry.add("svc", entry);

        let resolved = registry.candidates(&RemoteBinding::new("svc", "h"));
        assert_eq!(resolved[0].timeout_ms, Some(500));
        assert_eq!(resolved[1].timeout_ms, Some(250));
        assert_eq!(resolved[0].backoff_ms, DEFAULT_BACKOFF_MS);

        let mut binding = RemoteBinding::new("svc", "h");
        binding.timeout_ms = Some(100);
        let resolved = registry.candidates(&binding);
        assert_eq!(resolved[0].timeout_ms, Some(100));
        assert_eq!(resolved[1].timeout_ms, Some(100));
    }

    #[test]
    fn unhealthy_endpoints_sort_out_until_none_remain() {
        let registry = ServiceRegistry::new();
        registry.add("svc", entry_with(&["a:1", "b:2"]));
        registry.mark_unhealthy("a:1");

        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["b:2"]);

        // With every endpoint unhealthy, all are offered again.
        registry.mark_unhealthy("b:2");
        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["a:1", "b:2"]);
    }

    #[test]
    fn failure_backoff_skips_endpoint_within_window() {
        let registry = ServiceRegistry::new();
        registry.add("svc", entry_with(&["a:1", "b:2"]));
        registry.mark_failure("a:1");

        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["b:2"]);

        // Recovery clears the stamp.
        registry.mark_healthy("a:1");
        let targets: Vec<String> = registry
            .candidates(&RemoteBinding::new("svc", "h"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["a:1", "b:2"]);
    }

    #[test]
    fn discovery_file_entries_parse_both_shapes() {
        let raw = r#"["plain:1", {"target": "full:2", "timeoutMs": 750, "metadata": {"k": "v"}}]"#;
        let entries: Vec<DiscoveredEntry> = serde_json::from_str(raw).unwrap();
        let endpoints: Vec<EndpointConfig> =
            entries.into_iter().map(EndpointConfig::from).collect();
        assert_eq!(endpoints[0].target, "plain:1");
        assert_eq!(endpoints[1].target, "full:2");
        assert_eq!(endpoints[1].timeout_ms, Some(750));
        assert_eq!(endpoints[1].metadata["k"], "v");
    }

    #[test]
    fn unknown_service_has_no_candidates() {
        let registry = ServiceRegistry::new();
        assert!(registry.candidates(&RemoteBinding::new("ghost", "h")).is_empty());
    }
}
