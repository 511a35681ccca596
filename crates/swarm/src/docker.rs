//! Docker Swarm backend driven through the `docker` CLI.
//!
//! Every call shells out with JSON output and parses it into the typed
//! handles of [`crate::types`]. Container details live on the node running the
//! task, so [`DockerSwarm::inspect_container`] opens a per-node connection
//! (`docker -H tcp://<node>:<node_port>`) unless `node_port` is zero, in which
//! case the manager connection is used for every node (single-host clusters).

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use {
    async_trait::async_trait,
    codehost_config::SwarmConfig,
    serde::Deserialize,
    tracing::{debug, info},
};

use crate::{
    Error, Orchestrator, Result,
    types::{
        ContainerHandle, LabelFilter, NodeInfo, PortBinding, PublishMode, ServiceHandle,
        ServiceSpec, TaskInfo, TaskState,
    },
};

/// Swarm manager reached through the docker CLI.
pub struct DockerSwarm {
    config: SwarmConfig,
}

impl DockerSwarm {
    pub fn new(config: SwarmConfig) -> Self {
        Self { config }
    }

    /// Check that the CLI can talk to a swarm manager.
    pub async fn is_available(&self) -> bool {
        self.run(
            "docker info",
            None,
            &[
                "info".to_string(),
                "--format".to_string(),
                "{{.Swarm.ControlAvailable}}".to_string(),
            ],
        )
        .await
        .is_ok_and(|out| out.trim() == "true")
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs.max(1))
    }

    /// Docker endpoint for a node, or `None` to use the manager connection.
    fn node_endpoint(&self, node: &NodeInfo) -> Option<String> {
        if self.config.node_port == 0 {
            return None;
        }
        node.addr
            .as_ref()
            .map(|addr| format!("tcp://{addr}:{}", self.config.node_port))
    }

    async fn run(&self, operation: &'static str, host: Option<&str>, args: &[String]) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.config.docker_bin);
        if let Some(host) = host.or(self.config.host.as_deref()) {
            cmd.args(["-H", host]);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(operation, host, "running docker command");

        let output = match tokio::time::timeout(self.timeout(), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::command_execution(operation, e)),
            Err(_) => {
                let secs = self.timeout().as_secs();
                return match host {
                    Some(node) => Err(Error::node_unreachable(node, format!("timed out after {secs}s"))),
                    None => Err(Error::Timeout { operation, secs }),
                };
            },
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(operation, host, &stderr))
    }

    async fn inspect_services(&self, ids: &[String]) -> Result<Vec<ServiceHandle>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["service".to_string(), "inspect".to_string()];
        args.extend(ids.iter().cloned());
        let out = self.run("docker service inspect", None, &args).await?;
        parse_services(&out)
    }
}

#[async_trait]
impl Orchestrator for DockerSwarm {
    fn backend_name(&self) -> &'static str {
        "docker-swarm"
    }

    async fn create(&self, spec: &ServiceSpec) -> Result<ServiceHandle> {
        let args = create_args(spec);
        info!(service = %spec.name, image = %spec.image, "creating swarm service");
        let out = match self.run("docker service create", None, &args).await {
            Err(Error::AlreadyExists { .. }) => {
                return Err(Error::AlreadyExists {
                    name: spec.name.clone(),
                });
            },
            other => other?,
        };
        let id = out.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(Error::command_failed(
                "docker service create",
                "empty service ID",
            ));
        }
        self.get(&id).await?.ok_or_else(|| Error::not_found(id))
    }

    async fn get(&self, id_or_name: &str) -> Result<Option<ServiceHandle>> {
        match self.inspect_services(&[id_or_name.to_string()]).await {
            Ok(mut services) => Ok(services.pop()),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, filter: &LabelFilter) -> Result<Vec<ServiceHandle>> {
        let mut args = vec!["service".to_string(), "ls".to_string(), "-q".to_string()];
        args.extend(filter.to_args());
        let out = self.run("docker service ls", None, &args).await?;
        let ids: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        // One inspect per service: a single multi-ID inspect fails as a whole
        // when any of them is removed in between.
        let mut services = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.get(id).await? {
                Some(service) => services.push(service),
                None => debug!(service_id = %id, "service vanished while listing"),
            }
        }
        Ok(services)
    }

    async fn remove(&self, id_or_name: &str) -> Result<()> {
        info!(service = id_or_name, "removing swarm service");
        self.run("docker service rm", None, &[
            "service".to_string(),
            "rm".to_string(),
            id_or_name.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn tasks(&self, service_id: &str) -> Result<Vec<TaskInfo>> {
        let out = self
            .run("docker service ps", None, &[
                "service".to_string(),
                "ps".to_string(),
                "-q".to_string(),
                "--no-trunc".to_string(),
                service_id.to_string(),
            ])
            .await?;
        let ids: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "task".to_string(),
        ];
        args.extend(ids);
        let out = self.run("docker inspect task", None, &args).await?;
        parse_tasks(&out)
    }

    async fn node(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        match self
            .run("docker node inspect", None, &[
                "node".to_string(),
                "inspect".to_string(),
                node_id.to_string(),
            ])
            .await
        {
            Ok(out) => Ok(parse_nodes(&out)?.pop()),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn inspect_container(
        &self,
        node: &NodeInfo,
        container_id: &str,
    ) -> Result<ContainerHandle> {
        let endpoint = self.node_endpoint(node);
        let out = self
            .run("docker container inspect", endpoint.as_deref(), &[
                "container".to_string(),
                "inspect".to_string(),
                container_id.to_string(),
            ])
            .await?;
        parse_containers(&out, node)?
            .pop()
            .ok_or_else(|| Error::not_found(container_id))
    }

    async fn remove_container(&self, container: &ContainerHandle) -> Result<()> {
        let node = NodeInfo {
            id: container.node_id.clone(),
            hostname: container.node_name.clone(),
            addr: None,
        };
        let node = match self.node(&node.id).await? {
            Some(resolved) => resolved,
            None => node,
        };
        let endpoint = self.node_endpoint(&node);
        self.run("docker container rm", endpoint.as_deref(), &[
            "container".to_string(),
            "rm".to_string(),
            "-f".to_string(),
            container.id.clone(),
        ])
        .await?;
        Ok(())
    }
}

/// Map a failed CLI invocation onto the typed error taxonomy.
fn classify_failure(operation: &'static str, host: Option<&str>, stderr: &str) -> Error {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("already exists") || lower.contains("name conflicts") {
        return Error::AlreadyExists {
            name: String::new(),
        };
    }

    if lower.contains("port") && (lower.contains("already in use") || lower.contains("already allocated"))
    {
        let port = extract_port(&lower).unwrap_or_default();
        return Error::PortInUse { port };
    }

    if lower.contains("no such service")
        || lower.contains("no such container")
        || lower.contains("no such node")
        || lower.contains("no such task")
        || lower.contains("not found")
    {
        return Error::not_found(stderr.to_string());
    }

    if let Some(node) = host
        && (lower.contains("cannot connect to the docker daemon")
            || lower.contains("connection refused")
            || lower.contains("no route to host")
            || lower.contains("i/o timeout")
            || lower.contains("error during connect"))
    {
        return Error::node_unreachable(node, stderr.to_string());
    }

    Error::command_failed(operation, stderr.to_string())
}

/// First run of digits following "port" in an error message.
fn extract_port(message: &str) -> Option<u16> {
    let idx = message.find("port")?;
    message[idx..]
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Arguments for `docker service create`.
fn create_args(spec: &ServiceSpec) -> Vec<String> {
    let mut args = vec![
        "service".to_string(),
        "create".to_string(),
        "--detach".to_string(),
        "--quiet".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if let Some(ref hostname) = spec.hostname {
        args.extend(["--hostname".to_string(), hostname.clone()]);
    }
    for (k, v) in &spec.labels {
        args.extend(["--label".to_string(), format!("{k}={v}")]);
    }
    for (k, v) in &spec.container_labels {
        args.extend(["--container-label".to_string(), format!("{k}={v}")]);
    }
    for (k, v) in &spec.env {
        args.extend(["--env".to_string(), format!("{k}={v}")]);
    }
    for network in &spec.networks {
        args.extend(["--network".to_string(), network.clone()]);
    }
    for mount in &spec.mounts {
        let mut m = format!(
            "type={},source={},target={}",
            mount.kind, mount.source, mount.target
        );
        if mount.read_only {
            m.push_str(",readonly");
        }
        args.extend(["--mount".to_string(), m]);
    }
    for port in &spec.ports {
        args.extend([
            "--publish".to_string(),
            format!(
                "published={},target={},mode={}",
                port.published, port.target, port.mode
            ),
        ]);
    }
    if let Some(ref mem) = spec.resources.memory_limit {
        args.extend(["--limit-memory".to_string(), mem.clone()]);
    }
    if let Some(cpu) = spec.resources.cpu_limit {
        args.extend(["--limit-cpu".to_string(), cpu.to_string()]);
    }

    args.push(spec.image.clone());
    args
}

// ── JSON shapes of `docker ... inspect` ─────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawService {
    #[serde(rename = "ID")]
    id: String,
    created_at: Option<String>,
    updated_at: Option<String>,
    spec: RawServiceSpec,
    #[serde(default)]
    endpoint: Option<RawEndpoint>,
    #[serde(default)]
    update_status: Option<RawUpdateStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawServiceSpec {
    name: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    task_template: RawTaskTemplate,
    #[serde(default)]
    endpoint_spec: Option<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTaskTemplate {
    container_spec: RawContainerSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainerSpec {
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEndpoint {
    #[serde(default)]
    ports: Option<Vec<RawPort>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPort {
    target_port: u16,
    #[serde(default)]
    published_port: Option<u16>,
    #[serde(default)]
    publish_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawUpdateStatus {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTask {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
    #[serde(rename = "NodeID", default)]
    node_id: Option<String>,
    status: RawTaskStatus,
    #[serde(default)]
    desired_state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTaskStatus {
    #[serde(default)]
    timestamp: Option<String>,
    state: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    container_status: Option<RawContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainerStatus {
    #[serde(rename = "ContainerID", default)]
    container_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNode {
    #[serde(rename = "ID")]
    id: String,
    description: RawNodeDescription,
    #[serde(default)]
    status: Option<RawNodeStatus>,
    #[serde(default)]
    manager_status: Option<RawManagerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNodeDescription {
    hostname: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNodeStatus {
    #[serde(default)]
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawManagerStatus {
    #[serde(default)]
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    name: String,
    state: RawContainerState,
    config: RawContainerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainerState {
    status: String,
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainerConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

fn parse_publish_mode(mode: Option<&str>) -> PublishMode {
    match mode {
        Some("host") => PublishMode::Host,
        _ => PublishMode::Ingress,
    }
}

fn parse_services(json: &str) -> Result<Vec<ServiceHandle>> {
    let raw: Vec<RawService> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|s| {
            let env = s
                .spec
                .task_template
                .container_spec
                .env
                .unwrap_or_default()
                .into_iter()
                .filter_map(|kv| {
                    kv.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect();
            let ports = s
                .endpoint
                .and_then(|e| e.ports)
                .or_else(|| s.spec.endpoint_spec.and_then(|e| e.ports))
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| {
                    p.published_port.map(|published| PortBinding {
                        published,
                        target: p.target_port,
                        mode: parse_publish_mode(p.publish_mode.as_deref()),
                    })
                })
                .collect();
            ServiceHandle {
                id: s.id,
                name: s.spec.name,
                image: s.spec.task_template.container_spec.image,
                labels: s.spec.labels.unwrap_or_default(),
                env,
                ports,
                created_at: s.created_at,
                updated_at: s.updated_at,
                update_state: s.update_status.and_then(|u| u.state),
            }
        })
        .collect())
}

fn parse_tasks(json: &str) -> Result<Vec<TaskInfo>> {
    let raw: Vec<RawTask> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|t| TaskInfo {
            id: t.id,
            service_id: t.service_id,
            node_id: t.node_id.filter(|n| !n.is_empty()),
            container_id: t
                .status
                .container_status
                .and_then(|c| c.container_id)
                .filter(|c| !c.is_empty()),
            state: TaskState::parse(&t.status.state),
            desired_state: t
                .desired_state
                .as_deref()
                .map_or(TaskState::Unknown, TaskState::parse),
            message: t.status.message,
            error: t.status.err,
            timestamp: t.status.timestamp,
        })
        .collect())
}

fn parse_nodes(json: &str) -> Result<Vec<NodeInfo>> {
    let raw: Vec<RawNode> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|n| {
            // Managers may report 0.0.0.0 as their node address; the manager
            // status carries the routable one (host:port).
            let status_addr = n
                .status
                .and_then(|s| s.addr)
                .filter(|a| !a.is_empty() && a != "0.0.0.0");
            let manager_addr = n.manager_status.and_then(|m| m.addr).map(|a| {
                a.rsplit_once(':')
                    .map_or(a.clone(), |(host, _)| host.to_string())
            });
            NodeInfo {
                id: n.id,
                hostname: n.description.hostname,
                addr: status_addr.or(manager_addr),
            }
        })
        .collect())
}

fn parse_containers(json: &str, node: &NodeInfo) -> Result<Vec<ContainerHandle>> {
    let raw: Vec<RawContainer> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|c| ContainerHandle {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            node_id: node.id.clone(),
            node_name: node.hostname.clone(),
            labels: c.config.labels.unwrap_or_default(),
            status: c.state.status,
            running: c.state.running,
        })
        .collect())
}
