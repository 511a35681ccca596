//! Code host provisioning and reconciliation.
//!
//! One ephemeral development container per user and class enrollment, run as
//! an orchestrator service and mirrored by a [`HostRecord`]. [`HostManager`]
//! creates, stops and reaps hosts; [`Reconciler`] keeps the records in line
//! with what the orchestrator actually runs.

pub mod allocator;
pub mod context;
pub mod error;
pub mod manager;
pub mod probe;
pub mod reconcile;
pub mod record;
pub mod service;
pub mod spec;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    context::HostContext,
    error::{Error, Result},
    manager::{HostManager, PurgeReport, ReapCandidate, ReapReason},
    probe::{HttpProbe, ReadinessProbe},
    reconcile::{Reconciler, SyncReport},
    record::{AppState, HostFilter, HostRecord, HostState},
    service::CodeHost,
    spec::{ClassRef, HostnameKind, ImageProto, UserRef},
    store::HostStore,
    store_memory::InMemoryHostStore,
    store_sqlite::SqliteHostStore,
};

/// Run database migrations for the host record table.
///
/// Creates `code_hosts`. Call at startup before [`SqliteHostStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
