#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {
    async_trait::async_trait,
    codehost_config::{CodehostConfig, PortRange},
    codehost_hosts::{
        AppState, ClassRef, Error, HostContext, HostFilter, HostManager, HostRecord, HostState,
        HostStore, ImageProto, InMemoryHostStore, ReadinessProbe, Result, SqliteHostStore, UserRef,
    },
    codehost_swarm::InMemorySwarm,
};

/// Probe whose answer the test flips by hand.
#[derive(Default)]
pub struct ScriptedProbe {
    ready: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn is_ready(&self, _url: &str, _credentials: Option<(&str, &str)>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ready.load(Ordering::SeqCst)
    }
}

/// Store whose upserts fail for one service until healed.
pub struct FlakyStore {
    inner: SqliteHostStore,
    failing: Mutex<Option<String>>,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteHostStore::new("sqlite::memory:").await.unwrap(),
            failing: Mutex::new(None),
        }
    }

    pub fn fail_upserts_for(&self, service_id: &str) {
        *self.failing.lock().unwrap() = Some(service_id.to_string());
    }

    pub fn heal(&self) {
        *self.failing.lock().unwrap() = None;
    }
}

#[async_trait]
impl HostStore for FlakyStore {
    async fn list(&self, filter: &HostFilter) -> Result<Vec<HostRecord>> {
        self.inner.list(filter).await
    }

    async fn get_by_service_id(&self, service_id: &str) -> Result<Option<HostRecord>> {
        self.inner.get_by_service_id(service_id).await
    }

    async fn get_by_service_name(&self, service_name: &str) -> Result<Option<HostRecord>> {
        self.inner.get_by_service_name(service_name).await
    }

    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<HostRecord>> {
        self.inner.get_by_user_id(user_id).await
    }

    async fn upsert(&self, record: &HostRecord) -> Result<HostRecord> {
        let failing = self.failing.lock().unwrap().clone();
        if failing.as_deref() == Some(record.service_id.as_str()) {
            return Err(Error::Message {
                message: format!("database is locked ({})", record.service_id),
            });
        }
        self.inner.upsert(record).await
    }

    async fn mark_mia(&self, service_id: &str, now_ms: i64) -> Result<bool> {
        self.inner.mark_mia(service_id, now_ms).await
    }

    async fn set_state(
        &self,
        service_id: &str,
        state: HostState,
        app_state: Option<AppState>,
        now_ms: i64,
    ) -> Result<bool> {
        self.inner.set_state(service_id, state, app_state, now_ms).await
    }

    async fn record_activity(&self, service_name: &str, at_ms: i64) -> Result<bool> {
        self.inner.record_activity(service_name, at_ms).await
    }

    async fn delete(&self, service_id: &str) -> Result<bool> {
        self.inner.delete(service_id).await
    }
}

pub struct Harness {
    pub swarm: Arc<InMemorySwarm>,
    pub store: Arc<dyn HostStore>,
    pub probe: Arc<ScriptedProbe>,
    pub manager: HostManager,
}

pub fn config() -> CodehostConfig {
    let mut cfg = CodehostConfig::default();
    cfg.hosts.hostname = Some("localhost".into());
    cfg.hosts.reporting_url = Some("http://lms.test/telem".into());
    cfg.hosts.network = Some("codehost".into());
    cfg.hosts.vnc_port = None;
    cfg.hosts.port_range = PortRange {
        start: 25_000,
        end: 25_099,
    };
    cfg
}

pub fn harness_with(config: CodehostConfig, store: Arc<dyn HostStore>) -> Harness {
    let swarm = Arc::new(InMemorySwarm::new());
    let probe = Arc::new(ScriptedProbe::default());
    let ctx = HostContext::new(config, swarm.clone(), store.clone(), probe.clone());
    Harness {
        swarm,
        store,
        probe,
        manager: HostManager::new(ctx),
    }
}

pub fn harness() -> Harness {
    harness_with(config(), Arc::new(InMemoryHostStore::new()))
}

pub async fn sqlite_harness() -> Harness {
    let store = SqliteHostStore::new("sqlite::memory:").await.unwrap();
    harness_with(config(), Arc::new(store))
}

pub fn user(id: i64, username: &str) -> UserRef {
    UserRef {
        id,
        username: username.into(),
    }
}

pub fn proto() -> ImageProto {
    ImageProto {
        id: 3,
        name: "python".into(),
        image: "registry.test/python:3.12".into(),
    }
}

pub fn class() -> ClassRef {
    ClassRef {
        id: 9,
        name: "CS101".into(),
        repo_url: None,
    }
}
