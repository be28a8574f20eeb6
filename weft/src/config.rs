use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use weft_bridge::RegistryEntry;
use weft_observability::TelemetryConfig;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Load(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Load(msg) => write!(f, "config load error: {msg}"),
            ConfigError::Parse(msg) => write!(f, "config parse error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Bridge section of the server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    /// Address for the bridge's own Invoker/ControlPlane server; the
    /// bridge server is not started when unset.
    pub listen: Option<String>,
    /// Named registry entries for outbound invocation.
    pub registry: HashMap<String, RegistryEntry>,
}

/// Top-level server configuration.
///
/// Loaded from `application.yaml` with an `application-{profile}.yaml`
/// overlay, `.env` files, and a small set of environment overrides, or
/// built programmatically for tests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Fail startup when the emit/subscribe graph has one-sided topics.
    pub validate_events: bool,
    pub telemetry: TelemetryConfig,
    pub bridge: BridgeSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            validate_events: true,
            telemetry: TelemetryConfig::default(),
            bridge: BridgeSection::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration for the given profile.
    ///
    /// Resolution order (lowest to highest priority):
    /// 1. `application.yaml`
    /// 2. `application-{profile}.yaml`
    /// 3. `.env` / `.env.{profile}` (loaded into the process environment,
    ///    never overwriting variables already set)
    /// 4. `WEFT_HOST` / `WEFT_PORT` / `WEFT_VALIDATE_EVENTS`
    ///
    /// Profile resolution: `WEFT_PROFILE` env var > argument.
    pub fn load(profile: &str) -> Result<Self, ConfigError> {
        let active_profile =
            std::env::var("WEFT_PROFILE").unwrap_or_else(|_| profile.to_string());

        let mut merged = load_yaml_value(Path::new("application.yaml"))?;
        let profile_path = format!("application-{active_profile}.yaml");
        if let Some(overlay) = load_yaml_value(Path::new(&profile_path))? {
            merged = Some(match merged {
                Some(base) => merge_yaml(base, overlay),
                None => overlay,
            });
        }

        let _ = dotenvy::dotenv();
        let _ = dotenvy::from_filename(format!(".env.{active_profile}"));

        let mut config: ServerConfig = match merged {
            Some(value) => serde_yaml::from_value(value)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
            None => ServerConfig::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("WEFT_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("WEFT_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::Parse(format!("WEFT_PORT is not a port: {port}")))?;
        }
        if let Ok(validate) = std::env::var("WEFT_VALIDATE_EVENTS") {
            self.validate_events = matches!(validate.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_validate_events(mut self, validate: bool) -> Self {
        self.validate_events = validate;
        self
    }

    pub fn with_bridge_listen(mut self, listen: impl Into<String>) -> Self {
        self.bridge.listen = Some(listen.into());
        self
    }
}

fn load_yaml_value(path: &Path) -> Result<Option<serde_yaml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map(Some)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
}

/// Deep-merge two YAML documents, the overlay winning on conflicts.
fn merge_yaml(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}
