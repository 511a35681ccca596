//! Lifecycle operations used by the web application and the CLI.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use {
    codehost_common::now_ms,
    codehost_swarm::{Error as SwarmError, ServiceHandle},
    serde::Serialize,
    tracing::{error, info, warn},
};

use crate::{
    Error, Result,
    allocator::{self, PortAllocator},
    context::HostContext,
    reconcile::{Reconciler, SyncReport},
    record::{HostFilter, HostRecord},
    service::CodeHost,
    spec::{self, ClassRef, HostnameKind, ImageProto, UserRef, labels},
};

/// Creation attempts when the orchestrator reports a published port taken.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Why a record is eligible for reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapReason {
    Mia,
    Quiescent,
}

impl std::fmt::Display for ReapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mia => f.write_str("mia"),
            Self::Quiescent => f.write_str("quiescent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapCandidate {
    pub record: HostRecord,
    pub reason: ReapReason,
}

/// What [`HostManager::purge`] removed (or would remove).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub services: Vec<String>,
    pub records: Vec<String>,
}

/// Create, stop, look up and reap code hosts.
pub struct HostManager {
    ctx: Arc<HostContext>,
}

impl HostManager {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    /// Return the user's host, creating it when none exists.
    ///
    /// The user's live record is returned unchanged, whatever name it was
    /// created under. A MIA record under the user's service name is deleted
    /// first and replaced. A live one owned by another user (two usernames
    /// slugging alike) is a [`Error::NameTaken`] conflict. The new record has
    /// no container yet and is tagged with the prototype and class.
    pub async fn new_cs(
        &self,
        user: &UserRef,
        proto: &ImageProto,
        class: Option<&ClassRef>,
    ) -> Result<HostRecord> {
        let name = allocator::slugify(&user.username)?;

        if let Some(existing) = self.ctx.store.get_by_user_id(user.id).await? {
            info!(service = %existing.service_name, service_id = %existing.service_id, user_id = user.id, "code host already exists");
            return Ok(existing);
        }
        if let Some(existing) = self.ctx.store.get_by_service_name(&name).await? {
            if !existing.is_mia() {
                warn!(service = %name, user_id = user.id, owner = existing.user_id, "service name taken by another user");
                return Err(Error::name_taken(name, Some(existing.user_id)));
            }
            info!(service = %name, service_id = %existing.service_id, "superseding missing code host");
            self.ctx.store.delete(&existing.service_id).await?;
        }

        let created = async {
            let service = self.create_service(user, proto, class, &name).await?;
            CodeHost::new(Arc::clone(&self.ctx), service).try_sync(false).await
        }
        .await;

        match created {
            Ok(record) => {
                info!(service = %name, service_id = %record.service_id, "code host created");
                Ok(record)
            },
            Err(e @ (Error::Configuration { .. } | Error::NameTaken { .. })) => Err(e),
            Err(e) => {
                error!(service = %name, user_id = user.id, error = %e, "failed to start code host");
                Err(Error::start_failed(&user.username, e))
            },
        }
    }

    async fn create_service(
        &self,
        user: &UserRef,
        proto: &ImageProto,
        class: Option<&ClassRef>,
        name: &str,
    ) -> Result<ServiceHandle> {
        let config = &self.ctx.config;
        let ports_needed = config
            .hosts
            .hostname
            .as_deref()
            .map_or(0, |h| HostnameKind::classify(h).ports_needed(config));
        let mut rejected = BTreeSet::new();

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let records = self.ctx.store.list(&HostFilter::default()).await?;
            let mut in_use = allocator::ports_in_use(&records);
            in_use.extend(rejected.iter().copied());
            let ports = PortAllocator::new(config.hosts.port_range, in_use).allocate(ports_needed)?;

            let built =
                spec::build_service_spec(config, user, class, proto, &ports, None, now_ms())?;

            match self.ctx.orchestrator.create(&built.spec).await {
                Ok(service) => return Ok(service),
                Err(SwarmError::PortInUse { port }) if attempt < MAX_CREATE_ATTEMPTS => {
                    warn!(service = name, port, attempt, "published port taken, retrying");
                    rejected.insert(port);
                    rejected.extend(ports);
                },
                Err(SwarmError::AlreadyExists { .. }) => {
                    let service = self
                        .ctx
                        .orchestrator
                        .get(name)
                        .await?
                        .ok_or_else(|| Error::not_found(name))?;
                    let owner = service
                        .label(&self.ctx.label_key(labels::USER_ID))
                        .and_then(|v| v.parse::<i64>().ok());
                    if owner != Some(user.id) {
                        warn!(service = name, user_id = user.id, ?owner, "existing service belongs to another user");
                        return Err(Error::name_taken(name, owner));
                    }
                    info!(service = name, "service already exists, adopting it");
                    return Ok(service);
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::PortsExhausted {
            start: config.hosts.port_range.start,
            end: config.hosts.port_range.end,
        })
    }

    /// Create if absent, then wait for readiness.
    pub async fn start_and_wait(
        &self,
        user: &UserRef,
        proto: &ImageProto,
        class: Option<&ClassRef>,
        timeout: Duration,
    ) -> Result<HostRecord> {
        let record = self.new_cs(user, proto, class).await?;
        if record.is_ready() {
            return Ok(record);
        }

        let host = CodeHost::fetch(Arc::clone(&self.ctx), &record.service_id)
            .await?
            .ok_or_else(|| {
                Error::start_failed(&user.username, Error::not_found(&record.service_id))
            })?;
        let ready = match host.wait_until_ready(timeout).await {
            Ok(ready) => ready,
            Err(e @ Error::NotFound { .. }) => {
                error!(service_id = %record.service_id, user_id = user.id, "code host vanished while starting");
                return Err(Error::start_failed(&user.username, e));
            },
            Err(e) => return Err(e),
        };
        if !ready {
            warn!(service_id = %record.service_id, timeout_secs = timeout.as_secs(), "code host startup timed out");
            return Err(Error::StartupTimedOut {
                username: user.username.clone(),
                timeout_secs: timeout.as_secs(),
            });
        }
        self.ctx
            .store
            .get_by_service_id(&record.service_id)
            .await?
            .ok_or_else(|| Error::not_found(&record.service_id))
    }

    /// Remove the user's service. The record is kept; deleting it is the
    /// caller's decision.
    pub async fn stop_cs(&self, username: &str) -> Result<Option<HostRecord>> {
        let name = allocator::slugify(username)?;
        let record = self.ctx.store.get_by_service_name(&name).await?;
        let target = record
            .as_ref()
            .map_or(name.as_str(), |r| r.service_id.as_str());

        match self.ctx.orchestrator.remove(target).await {
            Ok(()) => {
                info!(service = %name, target, "code host stopped");
                Ok(record)
            },
            Err(SwarmError::NotFound { .. }) if record.is_some() => {
                info!(service = %name, "service already gone");
                Ok(record)
            },
            Err(SwarmError::NotFound { .. }) => Err(Error::not_found(username)),
            Err(e) => Err(e.into()),
        }
    }

    /// Force-remove the containers behind the user's service so the
    /// orchestrator replaces them. The record drops back to starting until a
    /// sync sees the new container answer.
    pub async fn restart_cs(&self, username: &str) -> Result<HostRecord> {
        let name = allocator::slugify(username)?;
        let host = CodeHost::fetch(Arc::clone(&self.ctx), &name)
            .await?
            .ok_or_else(|| Error::not_found(username))?;

        let containers = self.ctx.orchestrator.containers(host.id()).await?;
        for container in &containers {
            match self.ctx.orchestrator.remove_container(container).await {
                Ok(()) | Err(SwarmError::NotFound { .. }) => {},
                Err(e) => return Err(e.into()),
            }
        }
        info!(service = %name, containers = containers.len(), "code host restarted");
        host.try_sync(false).await
    }

    pub async fn get(&self, service_id: &str) -> Result<Option<HostRecord>> {
        self.ctx.store.get_by_service_id(service_id).await
    }

    /// Live view of a service, for readiness checks and ad hoc syncs.
    pub async fn host(&self, service_id: &str) -> Result<Option<CodeHost>> {
        CodeHost::fetch(Arc::clone(&self.ctx), service_id).await
    }

    pub async fn list(&self, filter: &HostFilter) -> Result<Vec<HostRecord>> {
        self.ctx.store.list(filter).await
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<HostRecord>> {
        let name = allocator::slugify(username)?;
        self.ctx.store.get_by_service_name(&name).await
    }

    pub async fn sync(&self, check_ready: bool) -> Result<SyncReport> {
        Reconciler::new(Arc::clone(&self.ctx)).sync(check_ready).await
    }

    /// Stamp activity reported by the user's container.
    pub async fn record_activity(&self, username: &str) -> Result<bool> {
        let name = allocator::slugify(username)?;
        self.ctx.store.record_activity(&name, now_ms()).await
    }

    /// Stop and forget MIA and quiescent hosts. With `dry_run`, only report.
    pub async fn reap(&self, dry_run: bool) -> Result<Vec<ReapCandidate>> {
        let now = now_ms();
        let idle_ms = self.ctx.idle_ms();
        let mut reaped = Vec::new();

        for record in self.ctx.store.list(&HostFilter::default()).await? {
            let reason = if record.is_mia() {
                ReapReason::Mia
            } else if record.is_quiescent(now, idle_ms) {
                ReapReason::Quiescent
            } else {
                continue;
            };

            if !dry_run && let Err(e) = self.remove_host(&record).await {
                warn!(service_id = %record.service_id, error = %e, "failed to reap code host");
                continue;
            }
            info!(service_id = %record.service_id, service = %record.service_name, %reason, dry_run, "reaping code host");
            reaped.push(ReapCandidate { record, reason });
        }
        Ok(reaped)
    }

    async fn remove_host(&self, record: &HostRecord) -> Result<()> {
        if self.ctx.orchestrator.get(&record.service_id).await?.is_some() {
            match self.ctx.orchestrator.remove(&record.service_id).await {
                Ok(()) | Err(SwarmError::NotFound { .. }) => {},
                Err(e) => return Err(e.into()),
            }
        }
        self.ctx.store.delete(&record.service_id).await?;
        Ok(())
    }

    /// Remove every managed service and delete every record.
    pub async fn purge(&self, dry_run: bool) -> Result<PurgeReport> {
        let services = self.ctx.orchestrator.list(&self.ctx.managed_filter()).await?;
        let records = self.ctx.store.list(&HostFilter::default()).await?;
        let mut report = PurgeReport::default();

        for service in services {
            if !dry_run && let Err(e) = self.ctx.orchestrator.remove(&service.id).await {
                warn!(service_id = %service.id, error = %e, "failed to remove service");
                continue;
            }
            report.services.push(service.name);
        }
        for record in records {
            if !dry_run && let Err(e) = self.ctx.store.delete(&record.service_id).await {
                warn!(service_id = %record.service_id, error = %e, "failed to delete record");
                continue;
            }
            report.records.push(record.service_id);
        }

        info!(
            services = report.services.len(),
            records = report.records.len(),
            dry_run,
            "purge finished"
        );
        Ok(report)
    }
}
