//! Config schema types (swarm connection, code host builder, readiness, reaping, database).
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodehostConfig {
    pub swarm: SwarmConfig,
    pub hosts: HostsConfig,
    pub readiness: ReadinessConfig,
    pub reap: ReapConfig,
    pub database: DatabaseConfig,
}

/// How to reach the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Docker CLI binary. Defaults to `docker`.
    pub docker_bin: String,
    /// Manager endpoint (`DOCKER_HOST` syntax). `None` uses the CLI default.
    pub host: Option<String>,
    /// Port of the remote Docker daemon on each worker node, used when a
    /// task's container has to be inspected on the node that runs it.
    pub node_port: u16,
    /// Prefix for the labels that mark and describe managed services.
    pub label_prefix: String,
    /// Upper bound for a single docker CLI invocation.
    pub command_timeout_secs: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            host: None,
            node_port: 2375,
            label_prefix: "codehost".into(),
            command_timeout_secs: 30,
        }
    }
}

/// Inclusive range of external ports handed out to code hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 25_000,
            end: 30_000,
        }
    }
}

impl PortRange {
    /// Number of ports in the range (zero when inverted).
    #[must_use]
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Inputs to the service definition builder.
///
/// `hostname`, `reporting_url` and `network` are required: the builder refuses
/// to produce a service when any of them is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Public (or development) hostname code hosts are reached under.
    pub hostname: Option<String>,
    /// Where containers report telemetry and heartbeats.
    pub reporting_url: Option<String>,
    /// Overlay network shared with the reverse proxy.
    pub network: Option<String>,
    /// Host directory holding per-user workspaces. No mount when unset.
    pub storage_dir: Option<String>,
    /// Mount point of the workspace inside the container.
    pub workspace_dir: String,
    pub port_range: PortRange,
    /// Port code-server listens on inside the container.
    pub container_port: u16,
    /// Port of the websocket/VNC bridge inside the container, if any.
    pub vnc_port: Option<u16>,
    /// Reverse proxy TLS certificate resolver name.
    pub cert_resolver: String,
    /// Reverse proxy entrypoint for HTTPS traffic.
    pub entrypoint: String,
    /// Memory limit passed to the service (e.g. "2G").
    pub memory_limit: Option<String>,
    /// CPU limit in cores.
    pub cpu_limit: Option<f64>,
    /// Extra environment variables added to every code host.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            reporting_url: None,
            network: None,
            storage_dir: None,
            workspace_dir: "/workspace".into(),
            port_range: PortRange::default(),
            container_port: 8080,
            vnc_port: Some(6080),
            cert_resolver: "letsencrypt".into(),
            entrypoint: "websecure".into(),
            memory_limit: None,
            cpu_limit: None,
            extra_env: BTreeMap::new(),
        }
    }
}

/// Readiness polling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// First delay between probes.
    pub poll_interval_ms: u64,
    /// Cap on the delay between probes.
    pub max_interval_ms: u64,
    /// Multiplier applied to the delay after each failed probe.
    pub backoff_factor: f64,
    /// Timeout of a single HTTP probe.
    pub probe_timeout_ms: u64,
    /// Wait used by interactive callers (web handlers, `host start`).
    pub interactive_timeout_secs: u64,
    /// Wait used by batch callers.
    pub batch_timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_interval_ms: 2_000,
            backoff_factor: 1.5,
            probe_timeout_ms: 3_000,
            interactive_timeout_secs: 60,
            batch_timeout_secs: 300,
        }
    }
}

/// Reaping of missing or idle hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReapConfig {
    /// A host with no activity for this long is quiescent.
    pub idle_minutes: u64,
}

impl Default for ReapConfig {
    fn default() -> Self {
        Self { idle_minutes: 240 }
    }
}

/// Where host records are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL. Defaults to `<data_dir>/codehost.db`.
    pub url: Option<String>,
}
