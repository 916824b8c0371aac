//! Lead-store access: advisory locks, lead lookup/update, run audit log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opar_core::RunLogEntry;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "opar-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadRecord {
    pub id: Uuid,
    pub primary_email: String,
    pub persona_sender_name: Option<String>,
    pub last_email_from: Option<String>,
    pub last_contact_at: Option<DateTime<Utc>>,
}

/// Only fields with a value are written; `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadUpdate {
    pub persona_sender_name: Option<String>,
    pub last_email_from: Option<String>,
    pub last_contact_at: Option<DateTime<Utc>>,
}

impl LeadUpdate {
    pub fn is_empty(&self) -> bool {
        self.persona_sender_name.is_none()
            && self.last_email_from.is_none()
            && self.last_contact_at.is_none()
    }
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn leads_by_emails(&self, emails: &[String]) -> Result<Vec<LeadRecord>, StoreError>;

    async fn update_lead(&self, id: Uuid, update: &LeadUpdate) -> Result<(), StoreError>;

    /// Non-blocking try-lock. `false` means the key is held elsewhere and
    /// the caller must abort, not queue.
    async fn try_acquire_lock(&self, key: i64) -> Result<bool, StoreError>;

    async fn release_lock(&self, key: i64) -> Result<(), StoreError>;

    async fn insert_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError>;
}

pub fn normalized_emails(emails: &[String]) -> Vec<String> {
    emails.iter().map(|email| email.to_lowercase()).collect()
}

/// Postgres-backed lead store.
///
/// Session advisory locks live on the connection that took them, so each
/// held lock pins a dedicated pool connection until it is released.
pub struct PgLeadStore {
    pool: PgPool,
    lock_conns: Mutex<HashMap<i64, PoolConnection<Postgres>>>,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn leads_by_emails(&self, emails: &[String]) -> Result<Vec<LeadRecord>, StoreError> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, primary_email, persona_sender_name, last_email_from, last_contact_at
              FROM leads
             WHERE lower(primary_email) = ANY($1)
            "#,
        )
        .bind(normalized_emails(emails))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LeadRecord {
                id: row.try_get("id")?,
                primary_email: row.try_get("primary_email")?,
                persona_sender_name: row.try_get("persona_sender_name")?,
                last_email_from: row.try_get("last_email_from")?,
                last_contact_at: row.try_get("last_contact_at")?,
            });
        }
        Ok(out)
    }

    async fn update_lead(&self, id: Uuid, update: &LeadUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE leads
               SET persona_sender_name = COALESCE($2, persona_sender_name),
                   last_email_from = COALESCE($3, last_email_from),
                   last_contact_at = COALESCE($4, last_contact_at),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.persona_sender_name)
        .bind(&update.last_email_from)
        .bind(update.last_contact_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, key: i64) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            debug!(key, "advisory lock acquired");
            self.lock_conns.lock().await.insert(key, conn);
        }
        Ok(acquired)
    }

    async fn release_lock(&self, key: i64) -> Result<(), StoreError> {
        let conn = self.lock_conns.lock().await.remove(&key);
        match conn {
            Some(mut conn) => {
                sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await?;
                debug!(key, "advisory lock released");
                Ok(())
            }
            None => Err(StoreError::Unavailable(format!(
                "advisory lock {key} is not held by this store"
            ))),
        }
    }

    async fn insert_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO attribution_run_logs
                   (date_from, date_to, leads_found, leads_updated, leads_skipped,
                    missing_leads, errors, runtime_ms, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.window.from)
        .bind(entry.window.to)
        .bind(entry.leads_found as i64)
        .bind(entry.leads_updated as i64)
        .bind(entry.leads_skipped as i64)
        .bind(entry.missing_leads as i64)
        .bind(serde_json::json!(entry.errors))
        .bind(entry.runtime_ms as i64)
        .bind(entry.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
