//! Persistence trait for host records.

use async_trait::async_trait;

use crate::{
    Result,
    record::{AppState, HostFilter, HostRecord, HostState},
};

/// Store of [`HostRecord`]s keyed by `service_id`.
///
/// Every mutation commits on its own; there is no cross-record transaction.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn list(&self, filter: &HostFilter) -> Result<Vec<HostRecord>>;
    async fn get_by_service_id(&self, service_id: &str) -> Result<Option<HostRecord>>;
    /// Most recently updated record with this service name.
    async fn get_by_service_name(&self, service_name: &str) -> Result<Option<HostRecord>>;
    /// Most recently updated non-MIA record of this user.
    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<HostRecord>>;
    /// Insert or replace the record with `record.service_id`. `created_at_ms`
    /// of an existing row is kept.
    async fn upsert(&self, record: &HostRecord) -> Result<HostRecord>;
    /// Flag the record as missing. Returns whether a row changed.
    async fn mark_mia(&self, service_id: &str, now_ms: i64) -> Result<bool>;
    async fn set_state(
        &self,
        service_id: &str,
        state: HostState,
        app_state: Option<AppState>,
        now_ms: i64,
    ) -> Result<bool>;
    /// Stamp user activity on the record named `service_name`.
    async fn record_activity(&self, service_name: &str, at_ms: i64) -> Result<bool>;
    async fn delete(&self, service_id: &str) -> Result<bool>;
}
