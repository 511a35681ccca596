use std::{sync::Arc, time::Duration};

use {
    codehost_config::CodehostConfig,
    codehost_swarm::{LabelFilter, Orchestrator},
};

use crate::{probe::ReadinessProbe, spec::labels, store::HostStore};

/// Collaborators shared by every code host operation.
///
/// Built once by the caller and passed around behind an `Arc`; nothing in
/// this crate reaches for global state.
pub struct HostContext {
    pub config: CodehostConfig,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub store: Arc<dyn HostStore>,
    pub probe: Arc<dyn ReadinessProbe>,
}

impl HostContext {
    pub fn new(
        config: CodehostConfig,
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn HostStore>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            orchestrator,
            store,
            probe,
        })
    }

    /// Full key of one of our labels.
    #[must_use]
    pub fn label_key(&self, name: &str) -> String {
        labels::key(&self.config.swarm.label_prefix, name)
    }

    /// Filter selecting services this system manages.
    #[must_use]
    pub fn managed_filter(&self) -> LabelFilter {
        LabelFilter::new().with(self.label_key(labels::MANAGED), "true")
    }

    #[must_use]
    pub fn idle_ms(&self) -> i64 {
        i64::try_from(self.config.reap.idle_minutes.saturating_mul(60_000)).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.config.readiness.interactive_timeout_secs)
    }

    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.config.readiness.batch_timeout_secs)
    }
}
