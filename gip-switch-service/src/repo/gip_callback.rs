use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::repo::RepoError;

/// Inbound gateway callback queue. Rows are written by the HTTP handler and
/// consumed by the callback processor; a row leaves PENDING exactly once.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct GipCallbackRecord {
    pub id: Uuid,
    pub session_id: String,
    pub function_code: String,
    pub action_code: String,
    pub tracking_number: Option<String>,
    pub reference_number: Option<String>,
    pub amount: Option<String>,
    pub payload: Option<String>,
    pub received_at: DateTime<Utc>,
    pub status: String,
    pub processing_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewGipCallback {
    pub session_id: String,
    pub function_code: String,
    pub action_code: String,
    pub tracking_number: Option<String>,
    pub reference_number: Option<String>,
    pub amount: Option<String>,
    pub payload: Option<String>,
}

#[async_trait]
pub trait GipCallbackRepo {
    async fn enqueue(&self, callback: &NewGipCallback) -> Result<Uuid, RepoError>;

    /// Oldest PENDING callbacks, up to `limit`.
    async fn fetch_batch(&self, limit: i64) -> Result<Vec<GipCallbackRecord>, RepoError>;

    /// Moves a PENDING callback to a terminal status. Returns false when the
    /// row was already resolved by another worker.
    async fn resolve(
        &self,
        id: &Uuid,
        status: &str,
        error: Option<String>,
    ) -> Result<bool, RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<GipCallbackRecord>, RepoError>;
}

pub struct DbGipCallbackRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbGipCallbackRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const COLUMNS: &str = "id, session_id, function_code, action_code, tracking_number, \
     reference_number, amount, payload, received_at, status, processing_error";

const INSERT_CALLBACK: &str = r#"
      INSERT INTO gip_callbacks
        (id, session_id, function_code, action_code, tracking_number, reference_number, amount, payload, received_at, status)
      VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'PENDING')
    "#;

const RESOLVE_CALLBACK: &str = r#"
      UPDATE gip_callbacks
      SET status = $2, processing_error = $3
      WHERE id = $1 AND status = 'PENDING'
    "#;

#[async_trait]
impl GipCallbackRepo for DbGipCallbackRepo<sqlx::Postgres> {
    async fn enqueue(&self, callback: &NewGipCallback) -> Result<Uuid, RepoError> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_CALLBACK)
            .bind(id)
            .bind(callback.session_id.clone())
            .bind(callback.function_code.clone())
            .bind(callback.action_code.clone())
            .bind(callback.tracking_number.clone())
            .bind(callback.reference_number.clone())
            .bind(callback.amount.clone())
            .bind(callback.payload.clone())
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(id)
    }

    async fn fetch_batch(&self, limit: i64) -> Result<Vec<GipCallbackRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM gip_callbacks WHERE status = 'PENDING' \
             ORDER BY received_at ASC LIMIT $1 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, GipCallbackRecord>(&query)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn resolve(
        &self,
        id: &Uuid,
        status: &str,
        error: Option<String>,
    ) -> Result<bool, RepoError> {
        let updated = sqlx::query(RESOLVE_CALLBACK)
            .bind(id)
            .bind(status)
            .bind(error)
            .execute(self.db_pool.deref())
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<GipCallbackRecord>, RepoError> {
        let query = format!("SELECT {COLUMNS} FROM gip_callbacks WHERE id = $1");
        sqlx::query_as::<_, GipCallbackRecord>(&query)
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl GipCallbackRepo for DbGipCallbackRepo<sqlx::Sqlite> {
    async fn enqueue(&self, callback: &NewGipCallback) -> Result<Uuid, RepoError> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_CALLBACK)
            .bind(id)
            .bind(callback.session_id.clone())
            .bind(callback.function_code.clone())
            .bind(callback.action_code.clone())
            .bind(callback.tracking_number.clone())
            .bind(callback.reference_number.clone())
            .bind(callback.amount.clone())
            .bind(callback.payload.clone())
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(id)
    }

    async fn fetch_batch(&self, limit: i64) -> Result<Vec<GipCallbackRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM gip_callbacks WHERE status = 'PENDING' \
             ORDER BY received_at ASC LIMIT $1"
        );
        sqlx::query_as::<_, GipCallbackRecord>(&query)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn resolve(
        &self,
        id: &Uuid,
        status: &str,
        error: Option<String>,
    ) -> Result<bool, RepoError> {
        let updated = sqlx::query(RESOLVE_CALLBACK)
            .bind(id)
            .bind(status)
            .bind(error)
            .execute(self.db_pool.deref())
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<GipCallbackRecord>, RepoError> {
        let query = format!("SELECT {COLUMNS} FROM gip_callbacks WHERE id = $1");
        sqlx::query_as::<_, GipCallbackRecord>(&query)
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}
