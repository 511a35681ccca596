//! In-memory orchestrator for tests and local development.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    Error, Orchestrator, Result,
    types::{
        ContainerHandle, LabelFilter, NodeInfo, ServiceHandle, ServiceSpec, TaskInfo, TaskState,
    },
};

#[derive(Default)]
struct State {
    services: BTreeMap<String, ServiceHandle>,
    tasks: Vec<TaskInfo>,
    nodes: BTreeMap<String, NodeInfo>,
    containers: BTreeMap<String, ContainerHandle>,
    unreachable: HashSet<String>,
    reserved_ports: BTreeSet<u16>,
    next_id: u64,
    create_calls: usize,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:08x}", self.next_id)
    }

    fn find_service(&self, id_or_name: &str) -> Option<&ServiceHandle> {
        self.services
            .get(id_or_name)
            .or_else(|| self.services.values().find(|s| s.name == id_or_name))
    }

    fn ports_in_use(&self) -> BTreeSet<u16> {
        self.services
            .values()
            .flat_map(|s| s.ports.iter().map(|p| p.published))
            .chain(self.reserved_ports.iter().copied())
            .collect()
    }
}

/// Orchestrator kept entirely in memory.
///
/// Created services get no tasks until [`InMemorySwarm::schedule`] places one,
/// so tests control exactly when a host starts running.
#[derive(Default)]
pub struct InMemorySwarm {
    state: Mutex<State>,
}

impl InMemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a node, returning it.
    pub fn add_node(&self, id: &str, hostname: &str) -> NodeInfo {
        let node = NodeInfo {
            id: id.to_string(),
            hostname: hostname.to_string(),
            addr: Some(format!("10.0.0.{}", self.lock().nodes.len() + 2)),
        };
        self.lock().nodes.insert(node.id.clone(), node.clone());
        node
    }

    /// Place a task of `service_id` on `node_id` in `state`, returning the
    /// task ID. A container is created for every state but `pending`.
    pub fn schedule(&self, service_id: &str, node_id: &str, state: TaskState) -> Option<String> {
        let mut st = self.lock();
        let service = st.services.get(service_id)?.clone();
        if !st.nodes.contains_key(node_id) {
            let node = NodeInfo {
                id: node_id.to_string(),
                hostname: node_id.to_string(),
                addr: None,
            };
            st.nodes.insert(node_id.to_string(), node);
        }
        let node_name = st.nodes.get(node_id).map(|n| n.hostname.clone()).unwrap_or_default();

        let task_id = st.next_id("task");
        let container_id = (state != TaskState::Pending).then(|| st.next_id("ctr"));
        if let Some(ref cid) = container_id {
            st.containers.insert(cid.clone(), ContainerHandle {
                id: cid.clone(),
                name: format!("{}.1.{task_id}", service.name),
                node_id: node_id.to_string(),
                node_name,
                labels: service.labels.clone(),
                status: state.to_string(),
                running: state.is_running(),
            });
        }
        st.tasks.push(TaskInfo {
            id: task_id.clone(),
            service_id: service.id,
            node_id: container_id.as_ref().map(|_| node_id.to_string()),
            container_id,
            state,
            desired_state: TaskState::Running,
            message: None,
            error: None,
            timestamp: None,
        });
        Some(task_id)
    }

    /// Move an existing task (and its container) to `state`.
    pub fn set_task_state(&self, task_id: &str, state: TaskState) {
        let mut st = self.lock();
        let Some(task) = st.tasks.iter_mut().find(|t| t.id == task_id) else {
            return;
        };
        task.state = state;
        let cid = task.container_id.clone();
        if let Some(container) = cid.and_then(|c| st.containers.get_mut(&c)) {
            container.status = state.to_string();
            container.running = state.is_running();
        }
    }

    /// Drop a service behind the caller's back, as if removed out of band.
    pub fn vanish(&self, id_or_name: &str) {
        let mut st = self.lock();
        let Some(id) = st.find_service(id_or_name).map(|s| s.id.clone()) else {
            return;
        };
        st.services.remove(&id);
        st.tasks.retain(|t| t.service_id != id);
    }

    /// Make container inspection on `node_id` fail as unreachable.
    pub fn mark_node_unreachable(&self, node_id: &str) {
        self.lock().unreachable.insert(node_id.to_string());
    }

    /// Claim a published port outside of any managed service.
    pub fn reserve_port(&self, port: u16) {
        self.lock().reserved_ports.insert(port);
    }

    /// Number of `create` calls, successful or not.
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Services currently known, in ID order.
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.lock().services.values().cloned().collect()
    }
}

#[async_trait]
impl Orchestrator for InMemorySwarm {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, spec: &ServiceSpec) -> Result<ServiceHandle> {
        let mut st = self.lock();
        st.create_calls += 1;

        if st.find_service(&spec.name).is_some() {
            return Err(Error::AlreadyExists {
                name: spec.name.clone(),
            });
        }
        let in_use = st.ports_in_use();
        if let Some(port) = spec.ports.iter().find(|p| in_use.contains(&p.published)) {
            return Err(Error::PortInUse {
                port: port.published,
            });
        }

        let handle = ServiceHandle {
            id: st.next_id("svc"),
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            env: spec.env.clone(),
            ports: spec.ports.clone(),
            created_at: None,
            updated_at: None,
            update_state: None,
        };
        st.services.insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    async fn get(&self, id_or_name: &str) -> Result<Option<ServiceHandle>> {
        Ok(self.lock().find_service(id_or_name).cloned())
    }

    async fn list(&self, filter: &LabelFilter) -> Result<Vec<ServiceHandle>> {
        Ok(self
            .lock()
            .services
            .values()
            .filter(|s| filter.matches(&s.labels))
            .cloned()
            .collect())
    }

    async fn remove(&self, id_or_name: &str) -> Result<()> {
        let mut st = self.lock();
        let id = st
            .find_service(id_or_name)
            .map(|s| s.id.clone())
            .ok_or_else(|| Error::not_found(id_or_name))?;
        st.services.remove(&id);
        let removed: Vec<String> = st
            .tasks
            .iter()
            .filter(|t| t.service_id == id)
            .filter_map(|t| t.container_id.clone())
            .collect();
        for cid in removed {
            st.containers.remove(&cid);
        }
        st.tasks.retain(|t| t.service_id != id);
        Ok(())
    }

    async fn tasks(&self, service_id: &str) -> Result<Vec<TaskInfo>> {
        let st = self.lock();
        let Some(id) = st.find_service(service_id).map(|s| s.id.clone()) else {
            return Err(Error::not_found(service_id));
        };
        Ok(st
            .tasks
            .iter()
            .filter(|t| t.service_id == id)
            .cloned()
            .collect())
    }

    async fn node(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        Ok(self.lock().nodes.get(node_id).cloned())
    }

    async fn inspect_container(
        &self,
        node: &NodeInfo,
        container_id: &str,
    ) -> Result<ContainerHandle> {
        let st = self.lock();
        if st.unreachable.contains(&node.id) {
            return Err(Error::node_unreachable(&node.hostname, "connection refused"));
        }
        st.containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::not_found(container_id))
    }

    async fn remove_container(&self, container: &ContainerHandle) -> Result<()> {
        let mut st = self.lock();
        if st.unreachable.contains(&container.node_id) {
            return Err(Error::node_unreachable(&container.node_name, "connection refused"));
        }
        st.containers
            .remove(&container.id)
            .ok_or_else(|| Error::not_found(&container.id))?;
        // The task dies with its container.
        for task in st.tasks.iter_mut() {
            if task.container_id.as_deref() == Some(container.id.as_str()) {
                task.state = TaskState::Shutdown;
            }
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{PortBinding, PublishMode, Workload},
    };

    fn spec(name: &str, port: Option<u16>) -> ServiceSpec {
        let mut spec = ServiceSpec {
            name: name.into(),
            image: "img:1".into(),
            ..Default::default()
        };
        spec.labels.insert("codehost.managed".into(), "true".into());
        if let Some(published) = port {
            spec.ports.push(PortBinding {
                published,
                target: 8080,
                mode: PublishMode::Host,
            });
        }
        spec
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names_and_ports() {
        let swarm = InMemorySwarm::new();
        swarm.create(&spec("alice", Some(25001))).await.unwrap();

        let err = swarm.create(&spec("alice", None)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        let err = swarm.create(&spec("bob", Some(25001))).await.unwrap_err();
        assert!(matches!(err, Error::PortInUse { port: 25001 }));

        swarm.reserve_port(25002);
        let err = swarm.create(&spec("bob", Some(25002))).await.unwrap_err();
        assert!(matches!(err, Error::PortInUse { port: 25002 }));

        assert_eq!(swarm.create_calls(), 4);
    }

    #[tokio::test]
    async fn get_by_id_or_name() {
        let swarm = InMemorySwarm::new();
        let svc = swarm.create(&spec("alice", None)).await.unwrap();
        assert_eq!(swarm.get(&svc.id).await.unwrap().unwrap().name, "alice");
        assert_eq!(swarm.get("alice").await.unwrap().unwrap().id, svc.id);
        assert!(swarm.get("ghost").await.unwrap().is_none());

        swarm.vanish("alice");
        assert!(swarm.get(&svc.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn containers_skip_unreachable_nodes() {
        let swarm = InMemorySwarm::new();
        swarm.add_node("n1", "worker-1");
        swarm.add_node("n2", "worker-2");
        let svc = swarm.create(&spec("alice", None)).await.unwrap();
        swarm.schedule(&svc.id, "n1", TaskState::Running).unwrap();
        swarm.schedule(&svc.id, "n2", TaskState::Running).unwrap();
        swarm.schedule(&svc.id, "n2", TaskState::Pending).unwrap();

        assert_eq!(swarm.containers(&svc.id).await.unwrap().len(), 2);

        swarm.mark_node_unreachable("n2");
        let containers = swarm.containers(&svc.id).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].node_name, "worker-1");
    }

    #[tokio::test]
    async fn terminal_tasks_have_no_live_containers() {
        let swarm = InMemorySwarm::new();
        let svc = swarm.create(&spec("alice", None)).await.unwrap();
        let task = swarm.schedule(&svc.id, "n1", TaskState::Starting).unwrap();
        assert_eq!(swarm.containers(&svc.id).await.unwrap().len(), 1);

        swarm.set_task_state(&task, TaskState::Failed);
        assert!(swarm.containers(&svc.id).await.unwrap().is_empty());
        assert_eq!(swarm.tasks(&svc.id).await.unwrap()[0].state, TaskState::Failed);
    }

    #[tokio::test]
    async fn workloads_list_services_then_containers() {
        let swarm = InMemorySwarm::new();
        let svc = swarm.create(&spec("alice", None)).await.unwrap();
        swarm.schedule(&svc.id, "n1", TaskState::Running).unwrap();

        let filter = LabelFilter::new().with("codehost.managed", "true");
        let workloads = swarm.workloads(&filter).await.unwrap();
        assert_eq!(workloads.len(), 2);
        assert!(matches!(workloads[0], Workload::Service(_)));
        assert_eq!(workloads[1].status(), "running");

        workloads[1].remove(&swarm).await.unwrap();
        assert!(swarm.containers(&svc.id).await.unwrap().is_empty());
        workloads[0].remove(&swarm).await.unwrap();
        assert!(swarm.services().is_empty());
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let swarm = InMemorySwarm::new();
        let err = swarm.remove("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
