//! Batched, bounded-concurrency erasure against the external analytics API.
//!
//! Every batch is delivered independently: a batch that fails permanently,
//! or exhausts its retries, only marks its own identifiers as failed. All
//! batch futures are driven on the calling task; a semaphore bounds how many
//! are active at once.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ExternalEraserConfig, RetryConfig},
    identifiers::IdentifierSet,
};

/// Classified result of one delivery attempt.
///
/// Decided once where the response is read, so retry logic never looks at
/// raw status codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// The request itself was rejected; retrying will not help.
    PermanentFailure { detail: String },
    /// Temporary condition on the remote side or in transport.
    TransientFailure { detail: String },
}

/// One batch deletion call.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub user_ids: &'a [String],
    pub requester: &'a str,
    pub request_id: &'a str,
}

/// Remote API able to delete a batch of identities.
#[async_trait]
pub trait ErasureApi: Send + Sync {
    async fn delete_batch(&self, batch: &BatchRequest<'_>) -> DeliveryOutcome;
}

/// Final state of a single identifier in the external stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl IdentifierOutcome {
    fn ok() -> Self {
        Self {
            ok: true,
            error_detail: None,
        }
    }

    fn failed(detail: &str) -> Self {
        Self {
            ok: false,
            error_detail: Some(detail.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Delivered,
    PermanentFailure,
    RetriesExhausted,
    Cancelled,
    Simulated,
}

/// Delivery record for one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDelivery {
    /// 1-based batch number.
    pub batch: usize,
    pub size: usize,
    pub status: BatchStatus,
    /// Calls actually made, 0 if the batch never dispatched.
    pub attempts: u32,
    /// Backoff slept before each retry, in order.
    pub backoff_ms: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of the external stage: exactly one entry per identifier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExternalOutcome {
    pub identifiers: BTreeMap<String, IdentifierOutcome>,
    pub batches: Vec<BatchDelivery>,
}

impl ExternalOutcome {
    pub fn successful_count(&self) -> usize {
        self.identifiers.values().filter(|o| o.ok).count()
    }

    pub fn failed_count(&self) -> usize {
        self.identifiers.values().filter(|o| !o.ok).count()
    }

    pub fn failed_identifiers(&self) -> impl Iterator<Item = &str> {
        self.identifiers
            .iter()
            .filter(|(_, o)| !o.ok)
            .map(|(id, _)| id.as_str())
    }

    fn record(&mut self, ids: &[String], delivery: BatchDelivery) {
        let outcome = match delivery.status {
            BatchStatus::Delivered | BatchStatus::Simulated => IdentifierOutcome::ok(),
            _ => IdentifierOutcome::failed(delivery.detail.as_deref().unwrap_or("unknown failure")),
        };
        for id in ids {
            self.identifiers.insert(id.clone(), outcome.clone());
        }
        self.batches.push(delivery);
    }
}

/// Drives batch deletions through an [`ErasureApi`].
pub struct ExternalEraser {
    api: Arc<dyn ErasureApi>,
    batch_size: Option<NonZeroUsize>,
    concurrent_batches: usize,
    retry: RetryConfig,
}

impl ExternalEraser {
    pub fn new(api: Arc<dyn ErasureApi>, config: &ExternalEraserConfig) -> Self {
        Self {
            api,
            batch_size: NonZeroUsize::new(config.batch_size),
            concurrent_batches: config.concurrent_batches.max(1),
            retry: config.retry.clone(),
        }
    }

    /// Delete every identifier, one batch per API call.
    ///
    /// Cancellation stops batches that have not dispatched yet and ends
    /// pending backoff waits; calls already in flight complete.
    pub async fn erase(
        &self,
        identifiers: &IdentifierSet,
        requester: &str,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> ExternalOutcome {
        let batches = identifiers.partition(self.batch_size);
        let total = batches.len();
        let semaphore = Semaphore::new(self.concurrent_batches);

        tracing::info!(
            identifiers = identifiers.len(),
            batches = total,
            concurrent_batches = self.concurrent_batches,
            max_attempts = self.retry.max_attempts,
            "Starting external erasure"
        );

        let deliveries = join_all(batches.iter().enumerate().map(|(index, ids)| {
            let request = BatchRequest {
                user_ids: ids,
                requester,
                request_id,
            };
            self.deliver(index, total, request, &semaphore, cancel)
        }))
        .await;

        let mut outcome = ExternalOutcome::default();
        for (ids, delivery) in batches.iter().zip(deliveries) {
            outcome.record(ids, delivery);
        }

        tracing::info!(
            successful = outcome.successful_count(),
            failed = outcome.failed_count(),
            "External erasure complete"
        );
        outcome
    }

    /// Dry-run stand-in for [`erase`](Self::erase): every identifier is
    /// reported as erased and no call is made.
    pub fn simulate(&self, identifiers: &IdentifierSet) -> ExternalOutcome {
        let mut outcome = ExternalOutcome::default();
        for (index, ids) in identifiers.partition(self.batch_size).into_iter().enumerate() {
            outcome.record(
                ids,
                BatchDelivery {
                    batch: index + 1,
                    size: ids.len(),
                    status: BatchStatus::Simulated,
                    attempts: 0,
                    backoff_ms: Vec::new(),
                    detail: None,
                },
            );
        }
        tracing::info!(
            identifiers = identifiers.len(),
            batches = outcome.batches.len(),
            "Simulated external erasure (dry run)"
        );
        outcome
    }

    async fn deliver(
        &self,
        index: usize,
        total: usize,
        request: BatchRequest<'_>,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
    ) -> BatchDelivery {
        let mut delivery = BatchDelivery {
            batch: index + 1,
            size: request.user_ids.len(),
            status: BatchStatus::Cancelled,
            attempts: 0,
            backoff_ms: Vec::new(),
            detail: None,
        };

        let Ok(_permit) = semaphore.acquire().await else {
            delivery.detail = Some("cancelled before dispatch".into());
            return delivery;
        };
        if cancel.is_cancelled() {
            tracing::debug!(batch = index + 1, total, "Batch cancelled before dispatch");
            delivery.detail = Some("cancelled before dispatch".into());
            return delivery;
        }

        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 0..max_attempts {
            delivery.attempts = attempt + 1;

            match self.api.delete_batch(&request).await {
                DeliveryOutcome::Success => {
                    if attempt > 0 {
                        tracing::debug!(
                            batch = index + 1,
                            attempt = attempt + 1,
                            "Batch delivered after retry"
                        );
                    }
                    delivery.status = BatchStatus::Delivered;
                    return delivery;
                }
                DeliveryOutcome::PermanentFailure { detail } => {
                    tracing::warn!(
                        batch = index + 1,
                        total,
                        size = delivery.size,
                        detail = %detail,
                        "Batch rejected permanently, not retrying"
                    );
                    delivery.status = BatchStatus::PermanentFailure;
                    delivery.detail = Some(detail);
                    return delivery;
                }
                DeliveryOutcome::TransientFailure { detail } => {
                    if attempt + 1 >= max_attempts {
                        tracing::warn!(
                            batch = index + 1,
                            total,
                            attempts = max_attempts,
                            detail = %detail,
                            "Batch failed after all retry attempts"
                        );
                        delivery.status = BatchStatus::RetriesExhausted;
                        delivery.detail = Some(format!(
                            "retries exhausted after {max_attempts} attempts: {detail}"
                        ));
                        return delivery;
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        batch = index + 1,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        detail = %detail,
                        "Transient batch failure, will retry after delay"
                    );
                    delivery.backoff_ms.push(delay.as_millis() as u64);

                    if !backoff(delay, cancel).await {
                        delivery.status = BatchStatus::Cancelled;
                        delivery.detail = Some(format!(
                            "cancelled after {} attempts: {detail}",
                            attempt + 1
                        ));
                        return delivery;
                    }
                }
            }
        }

        delivery
    }
}

/// Sleep for `delay`, returning false if cancellation arrives first.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// Scripted API: per-identifier responses keyed by the batch's first id,
    /// with an optional artificial latency to make batches overlap.
    #[derive(Default)]
    struct ScriptedApi {
        scripts: HashMap<String, Vec<DeliveryOutcome>>,
        latency: Duration,
        calls: Mutex<Vec<Vec<String>>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedApi {
        fn script(mut self, first_id: &str, outcomes: Vec<DeliveryOutcome>) -> Self {
            self.scripts.insert(first_id.to_string(), outcomes);
            self
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn calls_for(&self, first_id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.first().map(String::as_str) == Some(first_id))
                .count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ErasureApi for ScriptedApi {
        async fn delete_batch(&self, batch: &BatchRequest<'_>) -> DeliveryOutcome {
            let first = batch.user_ids[0].clone();
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(batch.user_ids.to_vec());
                calls.iter().filter(|c| c[0] == first).count() - 1
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.scripts.get(&first) {
                Some(script) => script[attempt.min(script.len() - 1)].clone(),
                None => DeliveryOutcome::Success,
            }
        }
    }

    fn transient() -> DeliveryOutcome {
        DeliveryOutcome::TransientFailure {
            detail: "HTTP 503: unavailable".into(),
        }
    }

    fn permanent() -> DeliveryOutcome {
        DeliveryOutcome::PermanentFailure {
            detail: "HTTP 400: invalid user id".into(),
        }
    }

    fn ids(n: usize) -> IdentifierSet {
        let raw: Vec<String> = (1..=n).map(|i| format!("u{i}")).collect();
        IdentifierSet::from_raw(&raw).unwrap()
    }

    fn config(batch_size: usize, concurrent_batches: usize) -> ExternalEraserConfig {
        ExternalEraserConfig {
            batch_size,
            concurrent_batches,
            retry: RetryConfig {
                max_attempts: 5,
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                backoff_multiplier: 2.0,
                jitter: 0.5,
            },
            ..Default::default()
        }
    }

    async fn run(api: Arc<ScriptedApi>, set: &IdentifierSet, cfg: &ExternalEraserConfig) -> ExternalOutcome {
        ExternalEraser::new(api, cfg)
            .erase(set, "dpo@example.com", "req-1", &CancellationToken::new())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_identifier_gets_one_outcome() {
        let api = Arc::new(ScriptedApi::default().script("u4", vec![permanent()]));
        let set = ids(10);
        let outcome = run(api, &set, &config(3, 2)).await;

        assert_eq!(outcome.identifiers.len(), set.len());
        for id in set.iter() {
            assert!(outcome.identifiers.contains_key(id), "missing {id}");
        }
        assert_eq!(outcome.batches.len(), 4);
        assert_eq!(outcome.successful_count() + outcome.failed_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let api = Arc::new(ScriptedApi::default().script("u3", vec![permanent()]));
        let outcome = run(api.clone(), &ids(4), &config(2, 4)).await;

        assert_eq!(api.calls_for("u3"), 1);
        let batch = &outcome.batches[1];
        assert_eq!(batch.status, BatchStatus::PermanentFailure);
        assert_eq!(batch.attempts, 1);
        assert!(batch.backoff_ms.is_empty());

        assert!(!outcome.identifiers["u3"].ok);
        assert!(!outcome.identifiers["u4"].ok);
        assert_eq!(
            outcome.identifiers["u4"].error_detail.as_deref(),
            Some("HTTP 400: invalid user id")
        );
        // Sibling batch unaffected
        assert!(outcome.identifiers["u1"].ok);
        assert!(outcome.identifiers["u2"].ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_until_exhausted() {
        let api = Arc::new(ScriptedApi::default().script("u1", vec![transient()]));
        let cfg = config(10, 1);
        let outcome = run(api.clone(), &ids(2), &cfg).await;

        assert_eq!(api.calls_for("u1"), 5);
        let batch = &outcome.batches[0];
        assert_eq!(batch.status, BatchStatus::RetriesExhausted);
        assert_eq!(batch.attempts, 5);
        assert_eq!(batch.backoff_ms.len(), 4);
        assert!(
            batch.backoff_ms.windows(2).all(|w| w[0] <= w[1]),
            "delays must be non-decreasing: {:?}",
            batch.backoff_ms
        );
        assert!(batch.backoff_ms.iter().all(|&d| d <= cfg.retry.max_delay_ms));

        let detail = outcome.identifiers["u1"].error_detail.as_deref().unwrap();
        assert!(detail.starts_with("retries exhausted after 5 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let api = Arc::new(
            ScriptedApi::default().script("u1", vec![transient(), transient(), DeliveryOutcome::Success]),
        );
        let outcome = run(api.clone(), &ids(3), &config(3, 1)).await;

        assert_eq!(api.calls_for("u1"), 3);
        assert_eq!(outcome.batches[0].status, BatchStatus::Delivered);
        assert_eq!(outcome.batches[0].attempts, 3);
        assert_eq!(outcome.failed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_configuration() {
        let api = Arc::new(ScriptedApi::default().script("u1", vec![transient()]));
        let mut cfg = config(5, 1);
        cfg.retry.max_attempts = 1;
        let outcome = run(api.clone(), &ids(1), &cfg).await;

        assert_eq!(api.total_calls(), 1);
        assert_eq!(outcome.batches[0].status, BatchStatus::RetriesExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let api = Arc::new(ScriptedApi::default().with_latency(Duration::from_millis(50)));
        let outcome = run(api.clone(), &ids(20), &config(2, 3)).await;

        assert_eq!(api.total_calls(), 10);
        assert_eq!(api.peak_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.successful_count(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batches_never_dispatch() {
        let api = Arc::new(ScriptedApi::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ExternalEraser::new(api.clone(), &config(2, 2))
            .erase(&ids(4), "dpo", "req-1", &cancel)
            .await;

        assert_eq!(api.total_calls(), 0);
        assert_eq!(outcome.failed_count(), 4);
        assert!(outcome.batches.iter().all(|b| b.status == BatchStatus::Cancelled));
        assert_eq!(
            outcome.identifiers["u1"].error_detail.as_deref(),
            Some("cancelled before dispatch")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let api = Arc::new(ScriptedApi::default().script("u1", vec![transient()]));
        let cancel = CancellationToken::new();
        let eraser = ExternalEraser::new(api.clone(), &config(5, 1));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = eraser.erase(&ids(2), "dpo", "req-1", &cancel).await;

        assert_eq!(api.total_calls(), 1);
        assert_eq!(outcome.batches[0].status, BatchStatus::Cancelled);
        assert!(!outcome.identifiers["u2"].ok);
    }

    #[test]
    fn test_simulate_marks_everything_ok() {
        let api = Arc::new(ScriptedApi::default().script("u1", vec![permanent()]));
        let outcome = ExternalEraser::new(api.clone(), &config(2, 2)).simulate(&ids(5));

        assert_eq!(api.total_calls(), 0);
        assert_eq!(outcome.identifiers.len(), 5);
        assert_eq!(outcome.successful_count(), 5);
        assert_eq!(outcome.batches.len(), 3);
        assert!(outcome.batches.iter().all(|b| b.status == BatchStatus::Simulated));
    }

    #[test]
    fn test_outcome_serialization_omits_empty_detail() {
        let json = serde_json::to_value(IdentifierOutcome::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true}));

        let json = serde_json::to_value(IdentifierOutcome::failed("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"ok": false, "error_detail": "boom"}));
    }
}
