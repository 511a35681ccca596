//! SQLite-backed host store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions, sqlite::SqliteRow},
};

use crate::{
    Result,
    error::Context,
    record::{AppState, HostFilter, HostRecord, HostState},
    store::HostStore,
};

const COLUMNS: &str = "service_id, service_name, user_id, class_id, proto_id, container_id, \
                       node_id, node_name, state, app_state, public_url, password, labels, \
                       created_at_ms, updated_at_ms, last_activity_ms";

/// SQLite-backed persistence for host records.
pub struct SqliteHostStore {
    pool: SqlitePool,
}

impl SqliteHostStore {
    /// Connect with a dedicated pool and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Use an existing pool. Call [`crate::run_migrations`] first.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delete every record. Returns the number of rows removed.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM code_hosts")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn parse_state<T: std::str::FromStr<Err = String>>(raw: &str, service_id: &str) -> Result<T> {
    raw.parse::<T>()
        .with_context(|| format!("bad state in record {service_id}"))
}

fn from_row(row: &SqliteRow) -> Result<HostRecord> {
    let state: String = row.try_get("state")?;
    let app_state: String = row.try_get("app_state")?;
    let labels: String = row.try_get("labels")?;
    let service_id: String = row.try_get("service_id")?;
    Ok(HostRecord {
        service_name: row.try_get("service_name")?,
        user_id: row.try_get("user_id")?,
        class_id: row.try_get("class_id")?,
        proto_id: row.try_get("proto_id")?,
        container_id: row.try_get("container_id")?,
        node_id: row.try_get("node_id")?,
        node_name: row.try_get("node_name")?,
        state: parse_state::<HostState>(&state, &service_id)?,
        app_state: parse_state::<AppState>(&app_state, &service_id)?,
        public_url: row.try_get("public_url")?,
        password: row.try_get("password")?,
        labels: serde_json::from_str(&labels)
            .with_context(|| format!("bad labels in record {service_id}"))?,
        created_at_ms: row.try_get("created_at_ms")?,
        service_id,
        updated_at_ms: row.try_get("updated_at_ms")?,
        last_activity_ms: row.try_get("last_activity_ms")?,
    })
}

#[async_trait]
impl HostStore for SqliteHostStore {
    async fn list(&self, filter: &HostFilter) -> Result<Vec<HostRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM code_hosts
             WHERE (?1 IS NULL OR state = ?1)
               AND (?2 IS NULL OR app_state = ?2)
               AND (?3 IS NULL OR class_id = ?3)
               AND (?4 IS NULL OR user_id = ?4)
             ORDER BY service_name, created_at_ms"
        ))
        .bind(filter.state.map(HostState::as_str))
        .bind(filter.app_state.map(AppState::as_str))
        .bind(filter.class_id)
        .bind(filter.user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(from_row).collect()
    }

    async fn get_by_service_id(&self, service_id: &str) -> Result<Option<HostRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM code_hosts WHERE service_id = ?"
        ))
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn get_by_service_name(&self, service_name: &str) -> Result<Option<HostRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM code_hosts WHERE service_name = ?
             ORDER BY updated_at_ms DESC LIMIT 1"
        ))
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<HostRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM code_hosts WHERE user_id = ? AND state != 'mia'
             ORDER BY updated_at_ms DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn upsert(&self, record: &HostRecord) -> Result<HostRecord> {
        let labels = serde_json::to_string(&record.labels)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO code_hosts ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(service_id) DO UPDATE SET
                service_name = excluded.service_name,
                user_id = excluded.user_id,
                class_id = excluded.class_id,
                proto_id = excluded.proto_id,
                container_id = excluded.container_id,
                node_id = excluded.node_id,
                node_name = excluded.node_name,
                state = excluded.state,
                app_state = excluded.app_state,
                public_url = excluded.public_url,
                password = excluded.password,
                labels = excluded.labels,
                updated_at_ms = excluded.updated_at_ms,
                last_activity_ms = COALESCE(excluded.last_activity_ms, code_hosts.last_activity_ms)"
        ))
        .bind(&record.service_id)
        .bind(&record.service_name)
        .bind(record.user_id)
        .bind(record.class_id)
        .bind(record.proto_id)
        .bind(&record.container_id)
        .bind(&record.node_id)
        .bind(&record.node_name)
        .bind(record.state.as_str())
        .bind(record.app_state.as_str())
        .bind(&record.public_url)
        .bind(&record.password)
        .bind(&labels)
        .bind(record.created_at_ms)
        .bind(record.updated_at_ms)
        .bind(record.last_activity_ms)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM code_hosts WHERE service_id = ?"
        ))
        .bind(&record.service_id)
        .fetch_one(&mut *tx)
        .await?;
        let stored = from_row(&row)?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn mark_mia(&self, service_id: &str, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE code_hosts SET state = 'mia', app_state = 'mia', updated_at_ms = ?
             WHERE service_id = ? AND (state != 'mia' OR app_state != 'mia')",
        )
        .bind(now_ms)
        .bind(service_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_state(
        &self,
        service_id: &str,
        state: HostState,
        app_state: Option<AppState>,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE code_hosts SET state = ?, app_state = COALESCE(?, app_state), updated_at_ms = ?
             WHERE service_id = ?",
        )
        .bind(state.as_str())
        .bind(app_state.map(AppState::as_str))
        .bind(now_ms)
        .bind(service_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_activity(&self, service_name: &str, at_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE code_hosts SET last_activity_ms = MAX(COALESCE(last_activity_ms, 0), ?)
             WHERE service_name = ? AND state != 'mia'",
        )
        .bind(at_ms)
        .bind(service_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, service_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM code_hosts WHERE service_id = ?")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
