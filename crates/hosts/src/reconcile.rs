//! Bulk reconciliation between the orchestrator and the record table.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use {
    codehost_common::now_ms,
    codehost_swarm::ServiceHandle,
    serde::Serialize,
    tracing::{info, warn},
};

use crate::{
    Result,
    context::HostContext,
    record::{AppState, HostFilter, HostState},
    service::CodeHost,
};

/// Outcome of one [`Reconciler::sync`] pass, as service IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records whose service vanished and were flagged MIA in this pass.
    pub marked_mia: Vec<String>,
    /// Not-ready records refreshed from live state.
    pub refreshed: Vec<String>,
    /// Services that had no record and got one.
    pub created: Vec<String>,
    /// Records that could not be synced; retried on the next pass.
    pub failed: Vec<String>,
}

impl SyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Reconciler {
    ctx: Arc<HostContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self { ctx }
    }

    /// Diff managed services against stored records and repair the records.
    ///
    /// Vanished services are flagged MIA before anything else so they are
    /// never mistaken for slow starters. Each record commits on its own; a
    /// failure is logged and left for the next pass.
    pub async fn sync(&self, check_ready: bool) -> Result<SyncReport> {
        let records = self.ctx.store.list(&HostFilter::default()).await?;
        let live: BTreeMap<String, ServiceHandle> = self
            .ctx
            .orchestrator
            .list(&self.ctx.managed_filter())
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let in_db: BTreeSet<&str> = records.iter().map(|r| r.service_id.as_str()).collect();
        let in_swarm: BTreeSet<&str> = live.keys().map(String::as_str).collect();
        let mut report = SyncReport::default();

        for id in in_db.difference(&in_swarm) {
            self.mark_mia(id, &mut report).await;
        }

        let not_ready = records.iter().filter(|r| {
            !r.is_mia()
                && in_swarm.contains(r.service_id.as_str())
                && (r.state != HostState::Running || r.app_state != AppState::Ready)
        });
        for record in not_ready {
            let id = record.service_id.as_str();
            match CodeHost::fetch(Arc::clone(&self.ctx), id).await {
                Ok(Some(host)) => match host.sync_to_db(check_ready).await {
                    Some(_) => report.refreshed.push(id.to_string()),
                    None => report.failed.push(id.to_string()),
                },
                Ok(None) => self.mark_mia(id, &mut report).await,
                Err(e) => {
                    warn!(service_id = id, error = %e, "failed to fetch service");
                    report.failed.push(id.to_string());
                },
            }
        }

        for id in in_swarm.difference(&in_db) {
            let Some(service) = live.get(*id) else {
                continue;
            };
            let host = CodeHost::new(Arc::clone(&self.ctx), service.clone());
            match host.sync_to_db(check_ready).await {
                Some(_) => report.created.push((*id).to_string()),
                None => report.failed.push((*id).to_string()),
            }
        }

        info!(
            records = records.len(),
            services = live.len(),
            marked_mia = report.marked_mia.len(),
            refreshed = report.refreshed.len(),
            created = report.created.len(),
            failed = report.failed.len(),
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn mark_mia(&self, service_id: &str, report: &mut SyncReport) {
        match self.ctx.store.mark_mia(service_id, now_ms()).await {
            Ok(true) => {
                info!(service_id, "code host missing from orchestrator, marked mia");
                report.marked_mia.push(service_id.to_string());
            },
            Ok(false) => {},
            Err(e) => {
                warn!(service_id, error = %e, "failed to mark code host mia");
                report.failed.push(service_id.to_string());
            },
        }
    }
}
