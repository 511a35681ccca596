use {async_trait::async_trait, tracing::warn};

use crate::{
    Error, Result,
    types::{ContainerHandle, LabelFilter, NodeInfo, ServiceHandle, ServiceSpec, TaskInfo, Workload},
};

/// Service, task, node and container primitives of the orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Human-readable backend name (e.g. "docker-swarm", "memory").
    fn backend_name(&self) -> &'static str;

    /// Create a service. A name clash is reported as [`Error::AlreadyExists`],
    /// a published port clash as [`Error::PortInUse`].
    async fn create(&self, spec: &ServiceSpec) -> Result<ServiceHandle>;

    /// Look up a service by ID or name. `Ok(None)` when it does not exist.
    async fn get(&self, id_or_name: &str) -> Result<Option<ServiceHandle>>;

    /// List services whose labels match `filter`.
    async fn list(&self, filter: &LabelFilter) -> Result<Vec<ServiceHandle>>;

    /// Remove a service by ID or name.
    async fn remove(&self, id_or_name: &str) -> Result<()>;

    /// Tasks of a service, current and historical.
    async fn tasks(&self, service_id: &str) -> Result<Vec<TaskInfo>>;

    /// Resolve a node ID. `Ok(None)` when the node left the cluster.
    async fn node(&self, node_id: &str) -> Result<Option<NodeInfo>>;

    /// Inspect a container on the node that runs it.
    async fn inspect_container(&self, node: &NodeInfo, container_id: &str)
    -> Result<ContainerHandle>;

    /// Force-remove a container on its node.
    async fn remove_container(&self, container: &ContainerHandle) -> Result<()>;

    /// Containers backing a service, resolved on their nodes.
    ///
    /// Tasks whose node cannot be resolved or reached are skipped and logged;
    /// one bad node never fails the whole listing.
    async fn containers(&self, service_id: &str) -> Result<Vec<ContainerHandle>> {
        let tasks = self.tasks(service_id).await?;
        let mut containers = Vec::new();
        for task in tasks {
            let (Some(node_id), Some(container_id)) = (&task.node_id, &task.container_id) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            let node = match self.node(node_id).await {
                Ok(Some(node)) => node,
                Ok(None) => {
                    warn!(service_id, node_id, task_id = %task.id, "task node left the cluster, skipping");
                    continue;
                },
                Err(e) => {
                    warn!(service_id, node_id, error = %e, "failed to resolve node, skipping");
                    continue;
                },
            };
            match self.inspect_container(&node, container_id).await {
                Ok(container) => containers.push(container),
                Err(Error::NodeUnreachable { node, reason }) => {
                    warn!(service_id, node = %node, %reason, "node unreachable, skipping task");
                },
                Err(e) => {
                    warn!(service_id, container_id, error = %e, "failed to inspect container, skipping");
                },
            }
        }
        Ok(containers)
    }

    /// Services matching `filter` followed by their resolved containers.
    async fn workloads(&self, filter: &LabelFilter) -> Result<Vec<Workload>> {
        let mut out = Vec::new();
        for service in self.list(filter).await? {
            let containers = self.containers(&service.id).await?;
            out.push(Workload::Service(service));
            out.extend(containers.into_iter().map(Workload::Container));
        }
        Ok(out)
    }
}
