//! In-memory store for tests and dry runs.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Result,
    record::{AppState, HostFilter, HostRecord, HostState},
    store::HostStore,
};

/// In-memory store backed by `HashMap`. No persistence.
pub struct InMemoryHostStore {
    records: Mutex<HashMap<String, HostRecord>>,
}

impl InMemoryHostStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryHostStore {
    fn default() -> Self {
        Self::new()
    }
}

fn latest<'a>(records: impl Iterator<Item = &'a HostRecord>) -> Option<HostRecord> {
    records.max_by_key(|r| r.updated_at_ms).cloned()
}

#[async_trait]
impl HostStore for InMemoryHostStore {
    async fn list(&self, filter: &HostFilter) -> Result<Vec<HostRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<HostRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.service_name
                .cmp(&b.service_name)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
        });
        Ok(out)
    }

    async fn get_by_service_id(&self, service_id: &str) -> Result<Option<HostRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(service_id).cloned())
    }

    async fn get_by_service_name(&self, service_name: &str) -> Result<Option<HostRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(latest(
            records.values().filter(|r| r.service_name == service_name),
        ))
    }

    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<HostRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(latest(
            records
                .values()
                .filter(|r| r.user_id == user_id && !r.is_mia()),
        ))
    }

    async fn upsert(&self, record: &HostRecord) -> Result<HostRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut stored = record.clone();
        if let Some(existing) = records.get(&record.service_id) {
            stored.created_at_ms = existing.created_at_ms;
            stored.last_activity_ms = record.last_activity_ms.or(existing.last_activity_ms);
        }
        records.insert(stored.service_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn mark_mia(&self, service_id: &str, now_ms: i64) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(service_id) {
            Some(r) if r.state != HostState::Mia || r.app_state != AppState::Mia => {
                r.state = HostState::Mia;
                r.app_state = AppState::Mia;
                r.updated_at_ms = now_ms;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn set_state(
        &self,
        service_id: &str,
        state: HostState,
        app_state: Option<AppState>,
        now_ms: i64,
    ) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let Some(r) = records.get_mut(service_id) else {
            return Ok(false);
        };
        r.state = state;
        if let Some(app_state) = app_state {
            r.app_state = app_state;
        }
        r.updated_at_ms = now_ms;
        Ok(true)
    }

    async fn record_activity(&self, service_name: &str, at_ms: i64) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut touched = false;
        for r in records
            .values_mut()
            .filter(|r| r.service_name == service_name && !r.is_mia())
        {
            r.last_activity_ms = Some(r.last_activity_ms.unwrap_or(0).max(at_ms));
            touched = true;
        }
        Ok(touched)
    }

    async fn delete(&self, service_id: &str) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.remove(service_id).is_some())
    }
}
