use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::db::error::DbResult;

/// Whether a chunk transaction is allowed to change anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Stage, run the deletion script, commit.
    Purge,
    /// Stage and count, then roll back without running the script.
    DryRun,
}

/// Per-chunk execution settings.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions<'a> {
    /// Name of the temporary staging relation (already validated as a plain
    /// SQL identifier).
    pub staging_table: &'a str,
    /// Server-side statement timeout, where the backend supports one.
    pub statement_timeout: Duration,
    pub mode: ChunkMode,
}

/// What a single chunk transaction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    /// Rows loaded into the staging relation.
    pub staged: u64,
    /// Rows affected by the deletion script (0 in dry-run).
    pub rows_affected: u64,
    /// Whether the transaction committed.
    pub committed: bool,
}

/// Transactional staging + deletion against one relational backend.
///
/// Each call runs in its own transaction on one pooled connection: create a
/// fresh staging relation, bulk-load `chunk`, count it, run `script`, then
/// commit (or roll back in dry-run). On any error the transaction is rolled
/// back and nothing from this chunk remains, including the staging relation.
#[async_trait]
pub trait PurgeStore: Send + Sync {
    async fn purge_chunk(
        &self,
        chunk: &[String],
        script: &str,
        options: &ChunkOptions<'_>,
    ) -> DbResult<ChunkReport>;
}
