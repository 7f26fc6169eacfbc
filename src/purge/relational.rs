//! Chunked transactional purge of the relational store.
//!
//! Chunks run strictly one after another so only one purge transaction is
//! ever open. The first failing chunk aborts the stage; chunks committed
//! before it stay committed, which makes the stage at-least-once per chunk
//! rather than atomic across the whole identifier set.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::DeletionProcedure;
use crate::{
    config::RelationalPurgeConfig,
    db::{ChunkMode, ChunkOptions, DbError, PurgeStore},
    identifiers::IdentifierSet,
};

#[derive(Debug, Error)]
pub enum RelationalError {
    #[error("chunk {} of {total} failed: {source}", .index + 1)]
    Chunk {
        index: usize,
        total: usize,
        #[source]
        source: DbError,
    },

    #[error("chunk {} of {total} exceeded the {}s statement timeout", .index + 1, .timeout.as_secs())]
    Timeout {
        index: usize,
        total: usize,
        timeout: Duration,
    },
}

impl RelationalError {
    pub fn chunk_index(&self) -> usize {
        match self {
            Self::Chunk { index, .. } | Self::Timeout { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationalStatus {
    /// Every chunk completed.
    Succeeded,
    /// A chunk failed; later chunks were not attempted.
    Failed,
    /// Cancellation was observed before a chunk started.
    Cancelled,
}

/// Result of the relational stage.
#[derive(Debug, Clone, Serialize)]
pub struct RelationalOutcome {
    pub status: RelationalStatus,
    pub mode: ChunkMode,
    pub chunks_total: usize,
    /// Chunks whose transaction finished, committed or (in dry-run) rolled back.
    pub chunks_completed: usize,
    /// Chunks whose deletions are durable.
    pub chunks_committed: usize,
    pub rows_staged: u64,
    pub rows_affected: u64,
    /// 1-based number of the chunk that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_chunk: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelationalOutcome {
    fn new(mode: ChunkMode, chunks_total: usize) -> Self {
        Self {
            status: RelationalStatus::Succeeded,
            mode,
            chunks_total,
            chunks_completed: 0,
            chunks_committed: 0,
            rows_staged: 0,
            rows_affected: 0,
            failed_chunk: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RelationalStatus::Succeeded
    }

    /// True when the stage stopped early after some chunks had already
    /// committed. Those deletions are not undone.
    pub fn partially_applied(&self) -> bool {
        !self.succeeded() && self.chunks_committed > 0
    }
}

/// Purge `identifiers` from the relational store one chunk at a time.
///
/// Cancellation is checked before every chunk. A chunk already in flight is
/// always allowed to finish or fail on its own. The statement timeout is
/// enforced by the store, which always awaits a COMMIT it has sent.
pub async fn purge_relational(
    store: &dyn PurgeStore,
    identifiers: &IdentifierSet,
    procedure: &DeletionProcedure,
    config: &RelationalPurgeConfig,
    mode: ChunkMode,
    cancel: &CancellationToken,
) -> RelationalOutcome {
    let chunks = identifiers.partition(config.chunk_size);
    let total = chunks.len();
    let options = ChunkOptions {
        staging_table: &config.staging_table,
        statement_timeout: config.statement_timeout(),
        mode,
    };
    let mut outcome = RelationalOutcome::new(mode, total);

    tracing::info!(
        identifiers = identifiers.len(),
        chunks = total,
        chunk_size = config.chunk_size.map(|s| s.get()),
        procedure_sha256 = procedure.sha256(),
        ?mode,
        "Starting relational purge"
    );

    for (index, chunk) in chunks.into_iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(
                chunk = index + 1,
                total,
                committed = outcome.chunks_committed,
                "Cancellation requested, skipping remaining chunks"
            );
            outcome.status = RelationalStatus::Cancelled;
            return outcome;
        }

        let result = store
            .purge_chunk(chunk, procedure.sql(), &options)
            .await
            .map_err(|source| match source {
                DbError::StatementTimeout(timeout) => RelationalError::Timeout {
                    index,
                    total,
                    timeout,
                },
                source => RelationalError::Chunk {
                    index,
                    total,
                    source,
                },
            });

        match result {
            Ok(report) => {
                outcome.chunks_completed += 1;
                outcome.rows_staged += report.staged;
                outcome.rows_affected += report.rows_affected;
                if report.committed {
                    outcome.chunks_committed += 1;
                }
                tracing::debug!(
                    chunk = index + 1,
                    total,
                    staged = report.staged,
                    rows_affected = report.rows_affected,
                    committed = report.committed,
                    "Chunk complete"
                );
            }
            Err(error) => {
                tracing::error!(
                    chunk = index + 1,
                    total,
                    committed = outcome.chunks_committed,
                    error = %error,
                    "Relational purge failed, aborting remaining chunks"
                );
                outcome.status = RelationalStatus::Failed;
                outcome.failed_chunk = Some(error.chunk_index() + 1);
                outcome.error = Some(error.to_string());
                return outcome;
            }
        }
    }

    tracing::info!(
        chunks = total,
        rows_staged = outcome.rows_staged,
        rows_affected = outcome.rows_affected,
        ?mode,
        "Relational purge complete"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::db::{ChunkReport, DbResult};

    /// In-memory store that records every chunk it is handed.
    #[derive(Default)]
    struct FakeStore {
        fail_on: Option<usize>,
        timeout_on: Option<usize>,
        cancel_after: Option<(usize, CancellationToken)>,
        /// Delay between a durable commit and the store returning.
        slow_ack: Option<Duration>,
        calls: Mutex<Vec<Vec<String>>>,
        durable_commits: AtomicUsize,
    }

    impl FakeStore {
        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PurgeStore for FakeStore {
        async fn purge_chunk(
            &self,
            chunk: &[String],
            _script: &str,
            options: &ChunkOptions<'_>,
        ) -> DbResult<ChunkReport> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(chunk.to_vec());
                calls.len() - 1
            };

            if let Some((after, token)) = &self.cancel_after
                && *after == call
            {
                token.cancel();
            }
            if self.timeout_on == Some(call) {
                return Err(DbError::StatementTimeout(options.statement_timeout));
            }
            if self.fail_on == Some(call) {
                return Err(serde_json::from_str::<u8>("not json").unwrap_err().into());
            }

            let committed = options.mode == ChunkMode::Purge;
            if committed {
                self.durable_commits.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(delay) = self.slow_ack {
                tokio::time::sleep(delay).await;
            }
            Ok(ChunkReport {
                staged: chunk.len() as u64,
                rows_affected: if committed { chunk.len() as u64 * 3 } else { 0 },
                committed,
            })
        }
    }

    fn ids(n: usize) -> IdentifierSet {
        let raw: Vec<String> = (1..=n).map(|i| format!("u{i}")).collect();
        IdentifierSet::from_raw(&raw).unwrap()
    }

    fn config(chunk_size: Option<usize>) -> RelationalPurgeConfig {
        RelationalPurgeConfig {
            chunk_size: chunk_size.and_then(NonZeroUsize::new),
            ..Default::default()
        }
    }

    fn procedure() -> DeletionProcedure {
        DeletionProcedure::from_script("erase.sql", "DELETE FROM users;").unwrap()
    }

    #[tokio::test]
    async fn test_single_chunk_when_unbounded() {
        let store = FakeStore::default();
        let outcome = purge_relational(
            &store,
            &ids(7),
            &procedure(),
            &config(None),
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.chunks_total, 1);
        assert_eq!(outcome.chunks_committed, 1);
        assert_eq!(outcome.rows_staged, 7);
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_chunks_cover_set_in_order() {
        let store = FakeStore::default();
        let set = ids(5);
        let outcome = purge_relational(
            &store,
            &set,
            &procedure(),
            &config(Some(2)),
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.chunks_total, 3);
        assert_eq!(outcome.chunks_committed, 3);
        assert_eq!(outcome.rows_affected, 15);

        let flattened: Vec<String> = store.calls().into_iter().flatten().collect();
        assert_eq!(flattened, set.as_slice());
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_chunks() {
        // Chunk 2 of 3 fails
        let store = FakeStore {
            fail_on: Some(1),
            ..Default::default()
        };
        let outcome = purge_relational(
            &store,
            &ids(6),
            &procedure(),
            &config(Some(2)),
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.status, RelationalStatus::Failed);
        assert_eq!(outcome.failed_chunk, Some(2));
        assert_eq!(outcome.chunks_committed, 1);
        assert!(outcome.partially_applied());
        assert!(outcome.error.as_deref().unwrap().starts_with("chunk 2 of 3 failed"));
        assert_eq!(store.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_first_chunk_failure_is_not_partial() {
        let store = FakeStore {
            fail_on: Some(0),
            ..Default::default()
        };
        let outcome = purge_relational(
            &store,
            &ids(4),
            &procedure(),
            &config(Some(2)),
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.status, RelationalStatus::Failed);
        assert!(!outcome.partially_applied());
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_timeout_is_fatal() {
        let store = FakeStore {
            timeout_on: Some(0),
            ..Default::default()
        };
        let cfg = RelationalPurgeConfig {
            statement_timeout_secs: 5,
            ..config(None)
        };
        let outcome = purge_relational(
            &store,
            &ids(3),
            &procedure(),
            &cfg,
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.status, RelationalStatus::Failed);
        assert_eq!(outcome.failed_chunk, Some(1));
        assert_eq!(
            outcome.error.as_deref(),
            Some("chunk 1 of 1 exceeded the 5s statement timeout")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_commit_acknowledgement_still_counts() {
        let store = FakeStore {
            slow_ack: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let cfg = RelationalPurgeConfig {
            statement_timeout_secs: 1,
            ..config(None)
        };
        let outcome = purge_relational(
            &store,
            &ids(3),
            &procedure(),
            &cfg,
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.chunks_committed, 1);
        assert_eq!(store.durable_commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_commit_before_failure_is_partial() {
        let store = FakeStore {
            slow_ack: Some(Duration::from_secs(2)),
            fail_on: Some(1),
            ..Default::default()
        };
        let cfg = RelationalPurgeConfig {
            statement_timeout_secs: 1,
            ..config(Some(2))
        };
        let outcome = purge_relational(
            &store,
            &ids(4),
            &procedure(),
            &cfg,
            ChunkMode::Purge,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.status, RelationalStatus::Failed);
        assert_eq!(outcome.failed_chunk, Some(2));
        assert_eq!(
            outcome.chunks_committed,
            store.durable_commits.load(Ordering::SeqCst)
        );
        assert!(outcome.partially_applied());
    }

    #[tokio::test]
    async fn test_dry_run_commits_nothing() {
        let store = FakeStore::default();
        let outcome = purge_relational(
            &store,
            &ids(5),
            &procedure(),
            &config(Some(2)),
            ChunkMode::DryRun,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.chunks_completed, 3);
        assert_eq!(outcome.chunks_committed, 0);
        assert_eq!(outcome.rows_staged, 5);
        assert_eq!(outcome.rows_affected, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = FakeStore::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = purge_relational(
            &store,
            &ids(3),
            &procedure(),
            &config(Some(1)),
            ChunkMode::Purge,
            &cancel,
        )
        .await;

        assert_eq!(outcome.status, RelationalStatus::Cancelled);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_chunks_keeps_commits() {
        let cancel = CancellationToken::new();
        let store = FakeStore {
            cancel_after: Some((0, cancel.clone())),
            ..Default::default()
        };

        let outcome = purge_relational(
            &store,
            &ids(3),
            &procedure(),
            &config(Some(1)),
            ChunkMode::Purge,
            &cancel,
        )
        .await;

        assert_eq!(outcome.status, RelationalStatus::Cancelled);
        assert_eq!(outcome.chunks_committed, 1);
        assert!(outcome.partially_applied());
        assert_eq!(store.calls().len(), 1);
    }
}
