use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::repo::RepoError;

/// Outbound webhook queue: one row per terminal notification owed to an
/// institution.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ClientCallbackRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub url: String,
    pub payload: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: String,
    pub last_http_status: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewClientCallback {
    pub url: String,
    pub payload: String,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
}

#[async_trait]
pub trait ClientCallbackRepo {
    async fn enqueue(
        &self,
        transaction_id: &Uuid,
        callback: &NewClientCallback,
    ) -> Result<Uuid, RepoError>;

    /// Due PENDING deliveries, oldest schedule first.
    async fn claim_due(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClientCallbackRecord>, RepoError>;

    async fn mark_delivered(
        &self,
        id: &Uuid,
        attempts: i32,
        http_status: i32,
    ) -> Result<(), RepoError>;

    async fn mark_retry(
        &self,
        id: &Uuid,
        attempts: i32,
        next_attempt_at: &DateTime<Utc>,
        http_status: Option<i32>,
        error: Option<String>,
    ) -> Result<(), RepoError>;

    async fn mark_failed(
        &self,
        id: &Uuid,
        attempts: i32,
        http_status: Option<i32>,
        error: Option<String>,
    ) -> Result<(), RepoError>;

    async fn get_by_transaction(
        &self,
        transaction_id: &Uuid,
    ) -> Result<Vec<ClientCallbackRecord>, RepoError>;
}

pub struct DbClientCallbackRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbClientCallbackRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const COLUMNS: &str = "id, transaction_id, url, payload, attempts, max_attempts, \
     next_attempt_at, status, last_http_status, last_error, created_at, updated_at";

const INSERT_CALLBACK: &str = r#"
      INSERT INTO client_callbacks
        (id, transaction_id, url, payload, attempts, max_attempts, next_attempt_at, status, created_at, updated_at)
      VALUES
        ($1, $2, $3, $4, 0, $5, $6, 'PENDING', $7, $7)
    "#;

const MARK_DELIVERED: &str = r#"
      UPDATE client_callbacks
      SET status = 'DELIVERED', attempts = $2, last_http_status = $3, last_error = NULL, updated_at = $4
      WHERE id = $1 AND status = 'PENDING'
    "#;

const MARK_RETRY: &str = r#"
      UPDATE client_callbacks
      SET attempts = $2, next_attempt_at = $3, last_http_status = $4, last_error = $5, updated_at = $6
      WHERE id = $1 AND status = 'PENDING'
    "#;

const MARK_FAILED: &str = r#"
      UPDATE client_callbacks
      SET status = 'FAILED', attempts = $2, last_http_status = $3, last_error = $4, updated_at = $5
      WHERE id = $1 AND status = 'PENDING'
    "#;

#[async_trait]
impl ClientCallbackRepo for DbClientCallbackRepo<sqlx::Postgres> {
    async fn enqueue(
        &self,
        transaction_id: &Uuid,
        callback: &NewClientCallback,
    ) -> Result<Uuid, RepoError> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_CALLBACK)
            .bind(id)
            .bind(transaction_id)
            .bind(callback.url.clone())
            .bind(callback.payload.clone())
            .bind(callback.max_attempts)
            .bind(callback.next_attempt_at)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(id)
    }

    async fn claim_due(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClientCallbackRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM client_callbacks \
             WHERE status = 'PENDING' AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, ClientCallbackRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn mark_delivered(
        &self,
        id: &Uuid,
        attempts: i32,
        http_status: i32,
    ) -> Result<(), RepoError> {
        sqlx::query(MARK_DELIVERED)
            .bind(id)
            .bind(attempts)
            .bind(http_status)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &Uuid,
        attempts: i32,
        next_attempt_at: &DateTime<Utc>,
        http_status: Option<i32>,
        error: Option<String>,
    ) -> Result<(), RepoError> {
        sqlx::query(MARK_RETRY)
            .bind(id)
            .bind(attempts)
            .bind(next_attempt_at)
            .bind(http_status)
            .bind(error)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &Uuid,
        attempts: i32,
        http_status: Option<i32>,
        error: Option<String>,
    ) -> Result<(), RepoError> {
        sqlx::query(MARK_FAILED)
            .bind(id)
            .bind(attempts)
            .bind(http_status)
            .bind(error)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn get_by_transaction(
        &self,
        transaction_id: &Uuid,
    ) -> Result<Vec<ClientCallbackRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM client_callbacks WHERE transaction_id = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, ClientCallbackRecord>(&query)
            .bind(transaction_id)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl ClientCallbackRepo for DbClientCallbackRepo<sqlx::Sqlite> {
    async fn enqueue(
        &self,
        transaction_id: &Uuid,
        callback: &NewClientCallback,
    ) -> Result<Uuid, RepoError> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_CALLBACK)
            .bind(id)
            .bind(transaction_id)
            .bind(callback.url.clone())
            .bind(callback.payload.clone())
            .bind(callback.max_attempts)
            .bind(callback.next_attempt_at)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(id)
    }

    async fn claim_due(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClientCallbackRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM client_callbacks \
             WHERE status = 'PENDING' AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, ClientCallbackRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn mark_delivered(
        &self,
        id: &Uuid,
        attempts: i32,
        http_status: i32,
    ) -> Result<(), RepoError> {
        sqlx::query(MARK_DELIVERED)
            .bind(id)
            .bind(attempts)
            .bind(http_status)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &Uuid,
        attempts: i32,
        next_attempt_at: &DateTime<Utc>,
        http_status: Option<i32>,
        error: Option<String>,
    ) -> Result<(), RepoError> {
        sqlx::query(MARK_RETRY)
            .bind(id)
            .bind(attempts)
            .bind(next_attempt_at)
            .bind(http_status)
            .bind(error)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &Uuid,
        attempts: i32,
        http_status: Option<i32>,
        error: Option<String>,
    ) -> Result<(), RepoError> {
        sqlx::query(MARK_FAILED)
            .bind(id)
            .bind(attempts)
            .bind(http_status)
            .bind(error)
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn get_by_transaction(
        &self,
        transaction_id: &Uuid,
    ) -> Result<Vec<ClientCallbackRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM client_callbacks WHERE transaction_id = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, ClientCallbackRecord>(&query)
            .bind(transaction_id)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}
