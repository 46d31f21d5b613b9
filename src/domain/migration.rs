//! Ambient catalog-writing side of `core::migration`: the SQL table the
//! core's `MigrationSink` seam writes into. Grounded in
//! `domain::repo::repository::SqliteRepoRepository`'s use of `sqlx::query`
//! against a `SqlitePool`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::core::errors::CoreError;
use crate::core::migration::{MigrationRecord, MigrationSink};

pub struct SqliteMigrationSink {
    pool: Arc<SqlitePool>,
}

impl SqliteMigrationSink {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationSink for SqliteMigrationSink {
    async fn emit(&self, record: MigrationRecord) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO migration_records (repo, tag, manifest_digest) VALUES (?, ?, ?)")
            .bind(record.repo)
            .bind(record.tag)
            .bind(record.manifest_digest.to_string())
            .execute(self.pool.as_ref())
            .await
            // `CoreError` has no catalog-specific variant; `RemoteFailure`
            // is the existing "external system, wrapped not hidden" case.
            .map_err(|e| CoreError::RemoteFailure(anyhow::anyhow!(e)))?;
        Ok(())
    }
}
