use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct AuditRecord {
    pub id: Uuid,
    pub level: String,
    pub kind: String,
    pub transaction_id: Option<Uuid>,
    pub message: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub level: String,
    pub kind: String,
    pub transaction_id: Option<Uuid>,
    pub message: String,
    pub details: Option<String>,
}

#[async_trait]
pub trait AuditRepo {
    async fn record(&self, entry: &NewAuditEntry) -> Result<(), RepoError>;

    /// The operator queue: most recent critical entries first.
    async fn critical_entries(&self, limit: i64) -> Result<Vec<AuditRecord>, RepoError>;

    async fn entries_for_transaction(
        &self,
        transaction_id: &Uuid,
    ) -> Result<Vec<AuditRecord>, RepoError>;
}

pub struct DbAuditRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbAuditRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const COLUMNS: &str = "id, level, kind, transaction_id, message, details, created_at";

const INSERT_ENTRY: &str = r#"
      INSERT INTO audit_log (id, level, kind, transaction_id, message, details, created_at)
      VALUES ($1, $2, $3, $4, $5, $6, $7)
    "#;

#[async_trait]
impl AuditRepo for DbAuditRepo<sqlx::Postgres> {
    async fn record(&self, entry: &NewAuditEntry) -> Result<(), RepoError> {
        sqlx::query(INSERT_ENTRY)
            .bind(Uuid::new_v4())
            .bind(entry.level.clone())
            .bind(entry.kind.clone())
            .bind(entry.transaction_id)
            .bind(entry.message.clone())
            .bind(entry.details.clone())
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn critical_entries(&self, limit: i64) -> Result<Vec<AuditRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM audit_log WHERE level = 'CRITICAL' ORDER BY created_at DESC LIMIT $1"
        );
        sqlx::query_as::<_, AuditRecord>(&query)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn entries_for_transaction(
        &self,
        transaction_id: &Uuid,
    ) -> Result<Vec<AuditRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM audit_log WHERE transaction_id = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, AuditRecord>(&query)
            .bind(transaction_id)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl AuditRepo for DbAuditRepo<sqlx::Sqlite> {
    async fn record(&self, entry: &NewAuditEntry) -> Result<(), RepoError> {
        sqlx::query(INSERT_ENTRY)
            .bind(Uuid::new_v4())
            .bind(entry.level.clone())
            .bind(entry.kind.clone())
            .bind(entry.transaction_id)
            .bind(entry.message.clone())
            .bind(entry.details.clone())
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn critical_entries(&self, limit: i64) -> Result<Vec<AuditRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM audit_log WHERE level = 'CRITICAL' ORDER BY created_at DESC LIMIT $1"
        );
        sqlx::query_as::<_, AuditRecord>(&query)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn entries_for_transaction(
        &self,
        transaction_id: &Uuid,
    ) -> Result<Vec<AuditRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS} FROM audit_log WHERE transaction_id = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, AuditRecord>(&query)
            .bind(transaction_id)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}
