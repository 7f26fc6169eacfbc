use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::{
    error::{DbError, DbResult},
    repos::{ChunkMode, ChunkOptions, ChunkReport, PurgeStore},
};

/// SQLite purge store.
///
/// SQLite has no `ON COMMIT DROP` and temp tables live as long as the
/// connection, so the staging table is dropped before it is created and
/// again before commit. A pooled connection reused by the next chunk never
/// sees the previous chunk's identifiers.
///
/// SQLite has no server-side statement timeout, so staging and the deletion
/// script run under a client-side deadline. Commit runs outside it: once
/// COMMIT is sent its outcome is always awaited.
pub struct SqlitePurgeStore {
    pool: SqlitePool,
}

impl SqlitePurgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurgeStore for SqlitePurgeStore {
    async fn purge_chunk(
        &self,
        chunk: &[String],
        script: &str,
        options: &ChunkOptions<'_>,
    ) -> DbResult<ChunkReport> {
        let mut tx = self.pool.begin().await?;

        // Dropping `tx` on timeout rolls the chunk back
        let (staged, rows_affected) = tokio::time::timeout(
            options.statement_timeout,
            stage_and_run(&mut tx, chunk, script, options),
        )
        .await
        .map_err(|_| DbError::StatementTimeout(options.statement_timeout))??;

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
            staged,
            rows_affected,
            committed,
        })
    }
}

/// Stage `chunk`, count it and (unless dry-run) run the deletion script.
/// Returns `(staged, rows_affected)`.
async fn stage_and_run(
    conn: &mut SqliteConnection,
    chunk: &[String],
    script: &str,
    options: &ChunkOptions<'_>,
) -> DbResult<(u64, u64)> {
    let table = options.staging_table;

    sqlx::query(&format!("DROP TABLE IF EXISTS temp.{table}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TEMP TABLE {table} (identifier TEXT PRIMARY KEY NOT NULL)"
    ))
    .execute(&mut *conn)
    .await?;

    // One set-based load through json_each instead of a row per identifier
    let payload = serde_json::to_string(chunk)?;
    sqlx::query(&format!(
        "INSERT INTO temp.{table} (identifier) SELECT value FROM json_each(?1)"
    ))
    .bind(payload)
    .execute(&mut *conn)
    .await?;

    let staged: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM temp.{table}"))
        .fetch_one(&mut *conn)
        .await?;

    let rows_affected = match options.mode {
        ChunkMode::Purge => sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(script)).await?.rows_affected(),
        ChunkMode::DryRun => 0,
    };

    sqlx::query(&format!("DROP TABLE temp.{table}"))
        .execute(&mut *conn)
        .await?;

    Ok((staged.max(0) as u64, rows_affected))
}
