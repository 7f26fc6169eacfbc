use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::{
    error::{DbError, DbResult},
    repos::{ChunkMode, ChunkOptions, ChunkReport, PurgeStore},
};

/// PostgreSQL purge store.
///
/// The staging table is created `ON COMMIT DROP` inside the chunk
/// transaction, and any same-named temp table left on a reused session is
/// dropped first. `SET LOCAL statement_timeout` bounds every statement of
/// the chunk, including the deletion script. The server cancels a statement
/// that runs over, so there is no client-side deadline and a sent COMMIT is
/// always awaited.
pub struct PostgresPurgeStore {
    pool: PgPool,
}

impl PostgresPurgeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurgeStore for PostgresPurgeStore {
    async fn purge_chunk(
        &self,
        chunk: &[String],
        script: &str,
        options: &ChunkOptions<'_>,
    ) -> DbResult<ChunkReport> {
        let table = options.staging_table;
        let timeout_ms = options.statement_timeout.as_millis().max(1);
        let mut tx = self.pool.begin().await?;

        // SET does not accept bind parameters
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS pg_temp.{table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TEMP TABLE {table} (identifier TEXT PRIMARY KEY) ON COMMIT DROP"
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO pg_temp.{table} (identifier) SELECT UNNEST($1::text[])"
        ))
        .bind(chunk)
        .execute(&mut *tx)
        .await
        .map_err(|e| statement_error(e, options))?;

        let staged: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM pg_temp.{table}"))
            .fetch_one(&mut *tx)
            .await?;

        let rows_affected = match options.mode {
            ChunkMode::Purge => sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(script))
                .await
                .map_err(|e| statement_error(e, options))?
                .rows_affected(),
            ChunkMode::DryRun => 0,
        };

        let committed = match options.mode {
            ChunkMode::Purge => {
                tx.commit().await?;
                true
            }
            ChunkMode::DryRun => {
                tx.rollback().await?;
                false
            }
        };

        Ok(ChunkReport {
            staged: staged.max(0) as u64,
            rows_affected,
            committed,
        })
    }
}

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";

fn statement_error(err: sqlx::Error, options: &ChunkOptions<'_>) -> DbError {
    if let sqlx::Error::Database(db) = &err
        && db.code().as_deref() == Some(QUERY_CANCELED)
    {
        return DbError::StatementTimeout(options.statement_timeout);
    }
    err.into()
}
