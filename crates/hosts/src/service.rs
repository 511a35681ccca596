//! Live view of one code host service.
//!
//! [`CodeHost`] wraps a [`ServiceHandle`] and derives everything the rest of
//! the system needs from it: credentials, URL, whether a task is running,
//! whether the code server answers, and the [`HostRecord`] that mirrors it.
//! All writes to the record table go through [`CodeHost::sync_to_db`] (or
//! its fallible twin [`CodeHost::try_sync`]).

use std::{sync::Arc, time::Duration};

use {
    codehost_common::now_ms,
    codehost_swarm::{ServiceHandle, TaskInfo},
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    context::HostContext,
    record::{AppState, HostRecord, HostState},
    spec::labels,
};

pub struct CodeHost {
    ctx: Arc<HostContext>,
    service: ServiceHandle,
}

impl CodeHost {
    pub fn new(ctx: Arc<HostContext>, service: ServiceHandle) -> Self {
        Self { ctx, service }
    }

    /// Look up the live service. `Ok(None)` when the orchestrator has no such
    /// service.
    pub async fn fetch(ctx: Arc<HostContext>, id_or_name: &str) -> Result<Option<Self>> {
        let service = ctx.orchestrator.get(id_or_name).await?;
        Ok(service.map(|s| Self::new(ctx, s)))
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    pub fn id(&self) -> &str {
        &self.service.id
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    fn label(&self, name: &str) -> Option<&str> {
        self.service.label(&self.ctx.label_key(name))
    }

    fn label_i64(&self, name: &str) -> Option<i64> {
        self.label(name).and_then(|v| v.parse().ok())
    }

    /// Hostname the service was built for, falling back to the configured one.
    pub fn hostname(&self) -> Option<&str> {
        self.label(labels::HOSTNAME)
            .or(self.ctx.config.hosts.hostname.as_deref())
    }

    pub fn public_url(&self) -> Option<&str> {
        self.label(labels::PUBLIC_URL)
    }

    pub fn username(&self) -> &str {
        self.label(labels::USERNAME)
            .unwrap_or(&self.service.name)
    }

    pub fn password(&self) -> Option<&str> {
        self.label(labels::PASSWORD)
    }

    /// The task currently backing the service.
    pub async fn current_task(&self) -> Result<Option<TaskInfo>> {
        let tasks = self.ctx.orchestrator.tasks(self.id()).await?;
        Ok(pick_current_task(tasks))
    }

    /// A task is scheduled and in the running state.
    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.current_task().await?.is_some_and(|t| t.is_running()))
    }

    /// The code server answers its readiness probe.
    pub async fn is_ready(&self) -> bool {
        let Some(url) = self.public_url() else {
            debug!(service_id = %self.id(), "no public url, not ready");
            return false;
        };
        let creds = self.password().map(|p| (self.service_name(), p));
        self.ctx.probe.is_ready(url, creds).await
    }

    /// Project live state and labels into a record. A service without a
    /// scheduled task yields a record with no container or node.
    pub async fn to_record(&self) -> Result<HostRecord> {
        let user_id = self
            .label_i64(labels::USER_ID)
            .ok_or_else(|| Error::malformed_service(self.id(), self.ctx.label_key(labels::USER_ID)))?;

        let task = self.current_task().await?;
        let running = task.as_ref().is_some_and(TaskInfo::is_running);
        let (container_id, node_id) = task
            .map(|t| (t.container_id, t.node_id))
            .unwrap_or_default();

        let node_name = match node_id.as_deref() {
            Some(node) => match self.ctx.orchestrator.node(node).await {
                Ok(info) => info.map(|n| n.hostname),
                Err(e) => {
                    warn!(service_id = %self.id(), node, error = %e, "failed to resolve node");
                    None
                },
            },
            None => None,
        };

        let now = now_ms();
        Ok(HostRecord {
            service_id: self.service.id.clone(),
            service_name: self.service.name.clone(),
            user_id,
            class_id: self.label_i64(labels::CLASS_ID),
            proto_id: self.label_i64(labels::PROTO_ID),
            container_id,
            node_id,
            node_name,
            state: if running {
                HostState::Running
            } else {
                HostState::Starting
            },
            app_state: AppState::Starting,
            public_url: self.public_url().map(str::to_string),
            password: self.password().map(str::to_string),
            labels: self.service.labels.clone(),
            created_at_ms: self.label_i64(labels::START_TIME).unwrap_or(now),
            updated_at_ms: now,
            last_activity_ms: None,
        })
    }

    /// Upsert the record for this service, probing readiness first when
    /// `check_ready` is set. Failures are logged and reported as `None`; the
    /// next sync retries from live state.
    pub async fn sync_to_db(&self, check_ready: bool) -> Option<HostRecord> {
        match self.try_sync(check_ready).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(service_id = %self.id(), service = %self.service_name(), error = %e, "failed to sync code host");
                None
            },
        }
    }

    pub async fn try_sync(&self, check_ready: bool) -> Result<HostRecord> {
        self.persist(None, check_ready).await
    }

    async fn persist(&self, known_ready: Option<bool>, check_ready: bool) -> Result<HostRecord> {
        let mut record = self.to_record().await?;
        let previous = self.ctx.store.get_by_service_id(self.id()).await?;

        let ready = match known_ready {
            Some(ready) => Some(ready),
            None if check_ready && record.state == HostState::Running => Some(self.is_ready().await),
            None => None,
        };
        record.app_state = next_app_state(previous.as_ref(), &record, ready);
        if let Some(ref prev) = previous {
            record.class_id = record.class_id.or(prev.class_id);
            record.proto_id = record.proto_id.or(prev.proto_id);
        }

        let stored = self.ctx.store.upsert(&record).await?;
        if previous.as_ref().is_none_or(|p| p.state != stored.state || p.app_state != stored.app_state) {
            info!(
                service_id = %stored.service_id,
                service = %stored.service_name,
                state = %stored.state,
                app_state = %stored.app_state,
                "code host state changed"
            );
        }
        Ok(stored)
    }

    /// Poll until the host runs and answers, or `timeout` passes.
    ///
    /// Probing starts at the configured poll interval and backs off up to the
    /// configured maximum. The record is synced once more on exit whatever
    /// the outcome. Returns whether the host became ready; a service that
    /// disappears meanwhile marks the record MIA and fails with `NotFound`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<bool> {
        let readiness = &self.ctx.config.readiness;
        let now = now_ms();
        if let Some(record) = self.ctx.store.get_by_service_id(self.id()).await?
            && matches!(record.state, HostState::Unknown)
        {
            self.ctx
                .store
                .set_state(self.id(), HostState::Starting, Some(AppState::Starting), now)
                .await?;
        }

        let deadline = Instant::now() + timeout;
        let max_delay = Duration::from_millis(readiness.max_interval_ms.max(readiness.poll_interval_ms));
        let mut delay = Duration::from_millis(readiness.poll_interval_ms.max(1));
        let mut probes = 0u32;

        let ready = loop {
            probes += 1;
            match self.is_running().await {
                Ok(true) => {
                    if self.is_ready().await {
                        break true;
                    }
                },
                Ok(false) => {},
                Err(e) if e.is_service_gone() => return Err(self.mark_vanished().await),
                Err(e) => warn!(service_id = %self.id(), error = %e, "failed to list tasks"),
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = next_delay(delay, readiness.backoff_factor, max_delay);
        };

        debug!(service_id = %self.id(), ready, probes, "readiness wait finished");
        let synced = if ready {
            self.persist(Some(true), false).await
        } else {
            self.try_sync(true).await
        };
        match synced {
            Ok(_) => Ok(ready),
            Err(e) if e.is_service_gone() => Err(self.mark_vanished().await),
            Err(e) => {
                warn!(service_id = %self.id(), service = %self.service_name(), error = %e, "failed to sync code host");
                Ok(ready)
            },
        }
    }

    /// Flag the record MIA after the service disappeared under us.
    async fn mark_vanished(&self) -> Error {
        match self.ctx.store.mark_mia(self.id(), now_ms()).await {
            Ok(_) => info!(service_id = %self.id(), service = %self.service_name(), "code host vanished while starting, marked mia"),
            Err(e) => warn!(service_id = %self.id(), error = %e, "failed to mark code host mia"),
        }
        Error::not_found(self.id())
    }
}

/// A running task if any, else the newest task that has not terminated.
/// Ties and missing timestamps fall back to listing order.
fn pick_current_task(tasks: Vec<TaskInfo>) -> Option<TaskInfo> {
    let (running, pending): (Vec<_>, Vec<_>) = tasks
        .into_iter()
        .filter(|t| !t.state.is_terminal())
        .partition(TaskInfo::is_running);
    let newest = |tasks: Vec<TaskInfo>| tasks.into_iter().max_by_key(TaskInfo::updated_at);
    newest(running).or_else(|| newest(pending))
}

/// Next poll interval, capped at `max`. Factors below 1.0 (and NaN) hold the
/// interval; anything too large to represent jumps straight to the cap.
fn next_delay(delay: Duration, factor: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor.max(1.0)).map_or(max, |d| d.min(max))
}

/// Readiness carried into the new record.
///
/// A passing probe on a running host makes it ready. Otherwise a ready host
/// stays ready as long as it still runs the same container; a failed probe
/// alone never demotes it.
fn next_app_state(previous: Option<&HostRecord>, record: &HostRecord, ready: Option<bool>) -> AppState {
    if record.state == HostState::Running && ready == Some(true) {
        return AppState::Ready;
    }
    match previous {
        Some(prev)
            if prev.app_state == AppState::Ready
                && record.state == HostState::Running
                && prev.container_id == record.container_id =>
        {
            AppState::Ready
        },
        _ => AppState::Starting,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::record::sample, codehost_swarm::TaskState};

    fn running(container: &str) -> HostRecord {
        let mut r = sample("s1", "alice", 1);
        r.state = HostState::Running;
        r.container_id = Some(container.into());
        r.node_id = Some("n1".into());
        r
    }

    #[test]
    fn passing_probe_on_running_host_is_ready() {
        assert_eq!(next_app_state(None, &running("c1"), Some(true)), AppState::Ready);
    }

    #[test]
    fn probe_on_starting_host_is_ignored() {
        let record = sample("s1", "alice", 1);
        assert_eq!(next_app_state(None, &record, Some(true)), AppState::Starting);
    }

    #[test]
    fn failed_probe_never_demotes() {
        let mut prev = running("c1");
        prev.app_state = AppState::Ready;
        assert_eq!(next_app_state(Some(&prev), &running("c1"), Some(false)), AppState::Ready);
        assert_eq!(next_app_state(Some(&prev), &running("c1"), None), AppState::Ready);
    }

    fn task(id: &str, state: TaskState, timestamp: Option<&str>) -> TaskInfo {
        let placed = state != TaskState::Pending;
        TaskInfo {
            id: id.into(),
            service_id: "s1".into(),
            node_id: placed.then(|| "n1".into()),
            container_id: placed.then(|| format!("c-{id}")),
            state,
            desired_state: TaskState::Running,
            message: None,
            error: None,
            timestamp: timestamp.map(str::to_string),
        }
    }

    #[test]
    fn current_task_is_the_newest_not_the_last_listed() {
        let tasks = vec![
            task("t3", TaskState::Preparing, Some("2024-03-01T10:05:00Z")),
            task("t2", TaskState::Failed, Some("2024-03-01T10:04:00Z")),
            task("t1", TaskState::Pending, Some("2024-03-01T10:00:00Z")),
        ];
        assert_eq!(pick_current_task(tasks).unwrap().id, "t3");

        let tasks = vec![
            task("t5", TaskState::Running, Some("2024-03-01T11:00:00Z")),
            task("t4", TaskState::Running, Some("2024-03-01T10:00:00Z")),
            task("t6", TaskState::Starting, Some("2024-03-01T12:00:00Z")),
        ];
        assert_eq!(pick_current_task(tasks).unwrap().id, "t5");

        let tasks = vec![task("a", TaskState::Pending, None), task("b", TaskState::Pending, None)];
        assert_eq!(pick_current_task(tasks).unwrap().id, "b");
        assert!(pick_current_task(vec![task("x", TaskState::Shutdown, None)]).is_none());
    }

    #[test]
    fn backoff_never_overflows() {
        let max = Duration::from_secs(5);
        let one = Duration::from_secs(1);
        assert_eq!(next_delay(one, 2.0, max), Duration::from_secs(2));
        assert_eq!(next_delay(one, 1e300, max), max);
        assert_eq!(next_delay(one, f64::INFINITY, max), max);
        assert_eq!(next_delay(one, 0.5, max), one);
        assert_eq!(next_delay(one, f64::NAN, max), one);
        assert_eq!(next_delay(Duration::MAX, 2.0, Duration::MAX), Duration::MAX);
    }

    #[test]
    fn replaced_container_needs_a_fresh_probe() {
        let mut prev = running("c1");
        prev.app_state = AppState::Ready;
        assert_eq!(next_app_state(Some(&prev), &running("c2"), None), AppState::Starting);
        assert_eq!(next_app_state(Some(&prev), &running("c2"), Some(true)), AppState::Ready);
    }
}
