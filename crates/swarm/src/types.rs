//! Orchestrator-facing data types.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// How a mount is backed on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind => f.write_str("bind"),
            Self::Volume => f.write_str("volume"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Port publishing mode. `Host` binds directly on the node running the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Ingress,
    Host,
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::Host => f.write_str("host"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub published: u16,
    pub target: u16,
    pub mode: PublishMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory limit (e.g. "2G").
    pub memory_limit: Option<String>,
    /// CPU limit in cores.
    pub cpu_limit: Option<f64>,
}

/// Everything the orchestrator needs to create one service.
///
/// Built fresh for every creation attempt and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    /// Hostname inside the container.
    pub hostname: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Service-level labels (reverse proxy routing, reverse lookup).
    pub labels: BTreeMap<String, String>,
    /// Labels copied onto every task container.
    pub container_labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub resources: Resources,
}

/// A live service as reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// Rolling update state, when the orchestrator reports one.
    pub update_state: Option<String>,
}

impl ServiceHandle {
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Swarm task lifecycle states, in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
    Unknown,
}

impl TaskState {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "pending" => Self::Pending,
            "assigned" => Self::Assigned,
            "accepted" => Self::Accepted,
            "preparing" => Self::Preparing,
            "ready" => Self::Ready,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "shutdown" => Self::Shutdown,
            "failed" => Self::Failed,
            "rejected" => Self::Rejected,
            "remove" => Self::Remove,
            "orphaned" => Self::Orphaned,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// The task will never run again; the orchestrator may replace it.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::Shutdown
                | Self::Failed
                | Self::Rejected
                | Self::Remove
                | Self::Orphaned
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Remove => "remove",
            Self::Orphaned => "orphaned",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One scheduled unit of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub service_id: String,
    pub node_id: Option<String>,
    pub container_id: Option<String>,
    pub state: TaskState,
    pub desired_state: TaskState,
    pub message: Option<String>,
    pub error: Option<String>,
    pub timestamp: Option<String>,
}

impl TaskInfo {
    /// Scheduled on a node and running there.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running() && self.node_id.is_some() && self.container_id.is_some()
    }

    /// When the task last changed status. `None` when the orchestrator did
    /// not report a parseable timestamp.
    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// A swarm node, with the address its daemon can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub hostname: String,
    pub addr: Option<String>,
}

/// A task container resolved on the node that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
    pub status: String,
    pub running: bool,
}

/// Either orchestrator object a caller may hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Service(ServiceHandle),
    Container(ContainerHandle),
}

impl Workload {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Service(s) => &s.id,
            Self::Container(c) => &c.id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Service(s) => &s.name,
            Self::Container(c) => &c.name,
        }
    }

    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Service(s) => &s.labels,
            Self::Container(c) => &c.labels,
        }
    }

    /// Container status, or the service's update state (`active` when the
    /// orchestrator reports none).
    #[must_use]
    pub fn status(&self) -> &str {
        match self {
            Self::Service(s) => s.update_state.as_deref().unwrap_or("active"),
            Self::Container(c) => &c.status,
        }
    }

    /// Remove the underlying object.
    pub async fn remove(&self, orchestrator: &dyn crate::Orchestrator) -> crate::Result<()> {
        match self {
            Self::Service(s) => orchestrator.remove(&s.id).await,
            Self::Container(c) => orchestrator.remove_container(c).await,
        }
    }
}

/// Label equality/presence filter for service listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    labels: Vec<(String, Option<String>)>,
}

impl LabelFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), Some(value.into())));
        self
    }

    /// Require `key` to be present with any value.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.labels.push((key.into(), None));
        self
    }

    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| match v {
            Some(v) => labels.get(k) == Some(v),
            None => labels.contains_key(k),
        })
    }

    /// `--filter label=...` arguments for the docker CLI.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        self.labels
            .iter()
            .flat_map(|(k, v)| {
                let expr = match v {
                    Some(v) => format!("label={k}={v}"),
                    None => format!("label={k}"),
                };
                ["--filter".to_string(), expr]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("running", TaskState::Running)]
    #[case("Preparing", TaskState::Preparing)]
    #[case(" shutdown ", TaskState::Shutdown)]
    #[case("bogus", TaskState::Unknown)]
    fn parses_task_states(#[case] raw: &str, #[case] expected: TaskState) {
        assert_eq!(TaskState::parse(raw), expected);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Shutdown.is_terminal());
        assert!(!TaskState::Starting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn task_running_requires_placement() {
        let mut task = TaskInfo {
            id: "t1".into(),
            service_id: "s1".into(),
            node_id: Some("n1".into()),
            container_id: None,
            state: TaskState::Running,
            desired_state: TaskState::Running,
            message: None,
            error: None,
            timestamp: None,
        };
        assert!(!task.is_running());
        task.container_id = Some("c1".into());
        assert!(task.is_running());
    }

    #[test]
    fn task_timestamps_compare_as_instants() {
        let at = |ts: &str| TaskInfo {
            id: "t".into(),
            service_id: "s1".into(),
            node_id: None,
            container_id: None,
            state: TaskState::Pending,
            desired_state: TaskState::Running,
            message: None,
            error: None,
            timestamp: Some(ts.into()),
        };
        // Docker trims trailing zeros from the fraction, so text order lies.
        let earlier = at("2024-03-01T10:00:05.9Z").updated_at().unwrap();
        let later = at("2024-03-01T10:00:05.95Z").updated_at().unwrap();
        assert!(earlier < later);
        assert_eq!(at("yesterday").updated_at(), None);
    }

    #[test]
    fn label_filter_matches_and_renders() {
        let filter = LabelFilter::new()
            .with("codehost.managed", "true")
            .with_key("codehost.username");
        let mut labels = BTreeMap::new();
        labels.insert("codehost.managed".to_string(), "true".to_string());
        assert!(!filter.matches(&labels));
        labels.insert("codehost.username".to_string(), "alice".to_string());
        assert!(filter.matches(&labels));

        assert_eq!(filter.to_args(), vec![
            "--filter",
            "label=codehost.managed=true",
            "--filter",
            "label=codehost.username",
        ]);
    }

    #[test]
    fn workload_surface() {
        let service = Workload::Service(ServiceHandle {
            id: "s1".into(),
            name: "alice".into(),
            ..Default::default()
        });
        assert_eq!(service.id(), "s1");
        assert_eq!(service.status(), "active");

        let container = Workload::Container(ContainerHandle {
            id: "c1".into(),
            name: "alice.1.abc".into(),
            node_id: "n1".into(),
            node_name: "worker-1".into(),
            labels: BTreeMap::new(),
            status: "running".into(),
            running: true,
        });
        assert_eq!(container.status(), "running");
        assert_eq!(container.name(), "alice.1.abc");
    }
}
