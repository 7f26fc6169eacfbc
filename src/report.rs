//! Run report aggregation and artifacts.
//!
//! A [`Report`] is assembled once when a run ends and is never modified
//! afterwards. It is written as pretty JSON for machines and as a plain-text
//! summary for the person who requested the erasure.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::{
    identifiers::IdentifierCounts,
    purge::{
        BatchDelivery, BatchStatus, DeletionProcedure, ExternalOutcome, IdentifierOutcome,
        RelationalOutcome, RelationalStatus,
    },
};

/// Failed identifiers listed by name in the text summary; the rest are
/// only counted.
const SUMMARY_LIST_LIMIT: usize = 20;

/// Highest numeric suffix tried before giving up on a free artifact name.
const MAX_ARTIFACT_SUFFIX: u32 = 1000;

/// Terminal status of an erasure run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Relational stage succeeded and every identifier was erased externally.
    Success,
    /// Relational stage succeeded, some identifiers failed externally.
    Partial,
    /// Input, setup or relational failure.
    Fatal,
    /// Cancellation observed before the run finished.
    Cancelled,
}

impl RunStatus {
    /// Process exit code for this status.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Fatal => 1,
            Self::Partial => 2,
            Self::Cancelled => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage a run stopped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Setup,
    Relational,
    External,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Setup => "setup",
            Self::Relational => "relational",
            Self::External => "external",
        })
    }
}

/// Request metadata carried into the report.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub request_id: String,
    pub requested_by: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
}

/// Which deletion script ran.
#[derive(Debug, Clone, Serialize)]
pub struct ProcedureRef {
    pub path: PathBuf,
    pub sha256: String,
}

impl From<&DeletionProcedure> for ProcedureRef {
    fn from(procedure: &DeletionProcedure) -> Self {
        Self {
            path: procedure.path().to_path_buf(),
            sha256: procedure.sha256().to_string(),
        }
    }
}

/// External stage section of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalReport {
    pub simulated: bool,
    pub successful_count: usize,
    pub failed_count: usize,
    pub outcomes: BTreeMap<String, IdentifierOutcome>,
    pub batches: Vec<BatchDelivery>,
}

impl ExternalReport {
    fn new(outcome: ExternalOutcome, simulated: bool) -> Self {
        Self {
            simulated,
            successful_count: outcome.successful_count(),
            failed_count: outcome.failed_count(),
            outcomes: outcome.identifiers,
            batches: outcome.batches,
        }
    }

    fn was_cancelled(&self) -> bool {
        self.batches
            .iter()
            .any(|b| b.status == BatchStatus::Cancelled)
    }
}

/// Complete, immutable record of one erasure run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub metadata: RunMetadata,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub exit_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifiers not confirmed erased from both stores.
    pub affected_identifiers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<IdentifierCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure: Option<ProcedureRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relational: Option<RelationalOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalReport>,
}

impl Report {
    /// Fatal report for a run that stopped before any relational work.
    pub fn rejected(metadata: RunMetadata, stage: Stage, error: impl fmt::Display) -> Self {
        Self {
            metadata,
            finished_at: Utc::now(),
            status: RunStatus::Fatal,
            exit_code: RunStatus::Fatal.exit_code(),
            failed_stage: Some(stage),
            error: Some(error.to_string()),
            affected_identifiers: 0,
            identifiers: None,
            procedure: None,
            relational: None,
            external: None,
        }
    }

    /// Combine stage outcomes into the final report.
    ///
    /// `external` is `None` when the external stage never ran, either because
    /// the relational stage did not succeed or because cancellation was
    /// observed between the stages.
    pub fn aggregate(
        metadata: RunMetadata,
        identifiers: IdentifierCounts,
        procedure: &DeletionProcedure,
        relational: RelationalOutcome,
        external: Option<ExternalOutcome>,
    ) -> Self {
        let simulated = metadata.dry_run;
        let external = external.map(|outcome| ExternalReport::new(outcome, simulated));
        let unique = identifiers.unique_count;

        let (status, failed_stage, error, affected) = match relational.status {
            RelationalStatus::Failed => (
                RunStatus::Fatal,
                Some(Stage::Relational),
                relational.error.clone(),
                unique,
            ),
            RelationalStatus::Cancelled => (RunStatus::Cancelled, None, None, unique),
            RelationalStatus::Succeeded => match &external {
                None => (RunStatus::Cancelled, None, None, unique),
                Some(ext) if ext.was_cancelled() => {
                    (RunStatus::Cancelled, None, None, ext.failed_count)
                }
                Some(ext) if ext.failed_count > 0 => (
                    RunStatus::Partial,
                    Some(Stage::External),
                    Some(format!(
                        "{} of {} identifiers could not be erased externally",
                        ext.failed_count, unique
                    )),
                    ext.failed_count,
                ),
                Some(_) => (RunStatus::Success, None, None, 0),
            },
        };

        Self {
            metadata,
            finished_at: Utc::now(),
            status,
            exit_code: status.exit_code(),
            failed_stage,
            error,
            affected_identifiers: affected,
            identifiers: Some(identifiers),
            procedure: Some(procedure.into()),
            relational: Some(relational),
            external,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    /// Human readable summary.
    pub fn summary(&self) -> Summary<'_> {
        Summary(self)
    }

    /// Base name shared by the JSON and text artifacts.
    ///
    /// Characters outside `[A-Za-z0-9._-]` become `_`. When that changes the
    /// request id, a digest of the original id is appended so `a/b` and
    /// `a_b` do not share a name.
    pub fn artifact_stem(&self) -> String {
        let request_id = &self.metadata.request_id;
        let safe: String = request_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if safe == *request_id {
            format!("erasure-{safe}")
        } else {
            let digest = hex::encode(Sha256::digest(request_id.as_bytes()));
            format!("erasure-{safe}-{}", &digest[..8])
        }
    }
}

/// Text rendering of a [`Report`].
pub struct Summary<'a>(&'a Report);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        let meta = &report.metadata;

        writeln!(
            f,
            "Erasure run {} requested by {}",
            meta.request_id, meta.requested_by
        )?;
        if meta.dry_run {
            writeln!(
                f,
                "Mode: DRY RUN (simulated; nothing was committed or sent)"
            )?;
        } else {
            writeln!(f, "Mode: live")?;
        }
        writeln!(
            f,
            "Status: {} (exit code {})",
            report.status, report.exit_code
        )?;
        if let Some(stage) = report.failed_stage {
            writeln!(f, "Failed stage: {stage}")?;
        }
        if let Some(error) = &report.error {
            writeln!(f, "Error: {error}")?;
        }
        writeln!(f, "Affected identifiers: {}", report.affected_identifiers)?;

        if let Some(counts) = &report.identifiers {
            writeln!(
                f,
                "Identifiers: {} requested, {} unique",
                counts.total_requested, counts.unique_count
            )?;
        }
        if let Some(procedure) = &report.procedure {
            writeln!(
                f,
                "Procedure: {} (sha256 {})",
                procedure.path.display(),
                procedure.sha256
            )?;
        }

        if let Some(relational) = &report.relational {
            let status = match relational.status {
                RelationalStatus::Succeeded => "succeeded",
                RelationalStatus::Failed => "failed",
                RelationalStatus::Cancelled => "cancelled",
            };
            writeln!(
                f,
                "Relational: {status}, {}/{} chunks completed, {} committed, {} rows staged, {} rows affected",
                relational.chunks_completed,
                relational.chunks_total,
                relational.chunks_committed,
                relational.rows_staged,
                relational.rows_affected
            )?;
            if relational.partially_applied() {
                writeln!(
                    f,
                    "Consistency: {} of {} chunks were committed before the run stopped. \
                     Their deletions are durable and were not rolled back; \
                     re-run the request to finish the remaining identifiers.",
                    relational.chunks_committed, relational.chunks_total
                )?;
            }
        }

        match &report.external {
            Some(external) => {
                writeln!(
                    f,
                    "External: {} erased, {} failed{}",
                    external.successful_count,
                    external.failed_count,
                    if external.simulated { " (simulated)" } else { "" }
                )?;
                if external.failed_count > 0 {
                    let failed: Vec<&str> = external
                        .outcomes
                        .iter()
                        .filter(|(_, o)| !o.ok)
                        .map(|(id, _)| id.as_str())
                        .take(SUMMARY_LIST_LIMIT)
                        .collect();
                    write!(f, "Failed identifiers: {}", failed.join(", "))?;
                    if external.failed_count > failed.len() {
                        write!(f, " (and {} more)", external.failed_count - failed.len())?;
                    }
                    writeln!(f)?;
                }
            }
            None if report.relational.is_some() => writeln!(f, "External: skipped")?,
            None => {}
        }

        writeln!(
            f,
            "Started: {}  Finished: {}",
            meta.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339()
        )
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report artifact '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no free artifact name for '{stem}' in '{}'", dir.display())]
    NoFreeName { dir: PathBuf, stem: String },

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError {
    let path = path.to_path_buf();
    move |source| ReportError::Io { path, source }
}

/// Paths of the written artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub json: PathBuf,
    pub summary: PathBuf,
}

/// Write `<stem>.json` and `<stem>.txt` into `dir`, creating it if needed.
///
/// Existing artifacts are never replaced. If either name is taken (a re-run
/// of the same request), the pair is written as `<stem>-1`, `<stem>-2` and
/// so on.
pub async fn write_artifacts(report: &Report, dir: &Path) -> Result<ArtifactPaths, ReportError> {
    tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;

    let mut body = serde_json::to_vec_pretty(report)?;
    body.push(b'\n');

    let (paths, mut json_file, mut summary_file) =
        reserve_artifacts(dir, &report.artifact_stem()).await?;

    json_file.write_all(&body).await.map_err(io_err(&paths.json))?;
    json_file.flush().await.map_err(io_err(&paths.json))?;
    summary_file
        .write_all(report.summary().to_string().as_bytes())
        .await
        .map_err(io_err(&paths.summary))?;
    summary_file.flush().await.map_err(io_err(&paths.summary))?;

    tracing::info!(
        json = %paths.json.display(),
        summary = %paths.summary.display(),
        "Wrote erasure report"
    );
    Ok(paths)
}

/// Create both artifact files under the first name where neither exists.
async fn reserve_artifacts(
    dir: &Path,
    stem: &str,
) -> Result<(ArtifactPaths, tokio::fs::File, tokio::fs::File), ReportError> {
    for n in 0..=MAX_ARTIFACT_SUFFIX {
        let name = if n == 0 {
            stem.to_string()
        } else {
            format!("{stem}-{n}")
        };
        let json = dir.join(format!("{name}.json"));
        let summary = dir.join(format!("{name}.txt"));

        let json_file = match create_new(&json).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(io_err(&json)(e)),
        };
        match create_new(&summary).await {
            Ok(summary_file) => {
                return Ok((ArtifactPaths { json, summary }, json_file, summary_file));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                drop(json_file);
                tokio::fs::remove_file(&json).await.map_err(io_err(&json))?;
            }
            Err(e) => return Err(io_err(&summary)(e)),
        }
    }

    Err(ReportError::NoFreeName {
        dir: dir.to_path_buf(),
        stem: stem.to_string(),
    })
}

async fn create_new(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}
