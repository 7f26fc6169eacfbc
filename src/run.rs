//! Erasure run coordinator.
//!
//! Sequences loader, relational purge and external erasure, then hands the
//! stage outcomes to [`Report::aggregate`]. The external stage only runs
//! after the relational stage succeeded: erasing analytics data for users
//! whose relational rows are still present would leave the two stores
//! disagreeing in the unsafe direction.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ExternalEraserConfig, RelationalPurgeConfig},
    db::{ChunkMode, PurgeStore},
    identifiers::IdentifierSet,
    purge::{DeletionProcedure, ErasureApi, ExternalEraser, purge_relational},
    report::{Report, RunMetadata, Stage},
};

/// One erasure request.
#[derive(Debug, Clone)]
pub struct ErasureRequest {
    pub request_id: String,
    pub requested_by: String,
    pub dry_run: bool,
    /// Raw identifiers, before normalization and deduplication.
    pub identifiers: Vec<String>,
}

impl ErasureRequest {
    /// New live request with a generated request id.
    pub fn new(requested_by: impl Into<String>, identifiers: Vec<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            requested_by: requested_by.into(),
            dry_run: false,
            identifiers,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Report metadata for this request, stamped with the current time.
    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            request_id: self.request_id.clone(),
            requested_by: self.requested_by.clone(),
            dry_run: self.dry_run,
            started_at: Utc::now(),
        }
    }
}

/// Owns the collaborators of an erasure run.
pub struct ErasureRunner {
    store: Arc<dyn PurgeStore>,
    eraser: ExternalEraser,
    procedure: DeletionProcedure,
    relational: RelationalPurgeConfig,
}

impl ErasureRunner {
    pub fn new(
        store: Arc<dyn PurgeStore>,
        api: Arc<dyn ErasureApi>,
        procedure: DeletionProcedure,
        relational: RelationalPurgeConfig,
        external: &ExternalEraserConfig,
    ) -> Self {
        Self {
            store,
            eraser: ExternalEraser::new(api, external),
            procedure,
            relational,
        }
    }

    /// Execute one erasure run. Always produces a report; failures are
    /// reflected in its status rather than returned as errors.
    #[tracing::instrument(
        skip_all,
        fields(request_id = %request.request_id, dry_run = request.dry_run)
    )]
    pub async fn run(&self, request: ErasureRequest, cancel: CancellationToken) -> Report {
        let metadata = request.metadata();

        let identifiers = match IdentifierSet::from_raw(request.identifiers.as_slice()) {
            Ok(set) => set,
            Err(error) => {
                tracing::error!(error = %error, "Identifier input rejected");
                return Report::rejected(metadata, Stage::Input, error);
            }
        };
        let counts = identifiers.counts();
        tracing::info!(
            total_requested = counts.total_requested,
            unique = counts.unique_count,
            requested_by = %request.requested_by,
            "Starting erasure run"
        );

        let mode = if request.dry_run {
            ChunkMode::DryRun
        } else {
            ChunkMode::Purge
        };
        let relational = purge_relational(
            self.store.as_ref(),
            &identifiers,
            &self.procedure,
            &self.relational,
            mode,
            &cancel,
        )
        .await;

        let external = if !relational.succeeded() {
            tracing::warn!(
                status = ?relational.status,
                "Skipping external erasure because the relational stage did not succeed"
            );
            None
        } else if cancel.is_cancelled() {
            tracing::warn!("Cancellation requested before external erasure");
            None
        } else if request.dry_run {
            Some(self.eraser.simulate(&identifiers))
        } else {
            Some(
                self.eraser
                    .erase(
                        &identifiers,
                        &request.requested_by,
                        &request.request_id,
                        &cancel,
                    )
                    .await,
            )
        };

        let report = Report::aggregate(metadata, counts, &self.procedure, relational, external);
        tracing::info!(
            status = %report.status,
            exit_code = report.exit_code(),
            affected_identifiers = report.affected_identifiers,
            "Erasure run finished"
        );
        report
    }
}
