//! Retry worker and failed-job ledger integration tests.

mod common;

use async_trait::async_trait;
use billing_engine::models::{
    AffectedEntity, EntityOutcome, FailedJob, FailedJobStatus, ListFailedJobsFilter,
};
use billing_engine::retry::{
    FailedJobLedger, HandlerRegistry, RetryHandler, RetryOutcome, RetryWorker,
};
use billing_engine::services::notifier::Severity;
use billing_engine::services::store::ClaimExpectation;
use chrono::{DateTime, Duration, Utc};
use common::{aged_account, ts, Harness};
use serde_json::json;
use service_core::error::AppError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

const SYNC_JOB: &str = "roster_sync";

/// Fails the first `failures` calls, then succeeds.
struct ScriptedHandler {
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedHandler {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetryHandler for ScriptedHandler {
    async fn retry(&self, _job: &FailedJob, _now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Ok(RetryOutcome::failure(format!("upstream unavailable (call {})", call)))
        } else {
            Ok(RetryOutcome::success("synced"))
        }
    }
}

struct PanickingHandler;

#[async_trait]
impl RetryHandler for PanickingHandler {
    async fn retry(&self, _job: &FailedJob, _now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        panic!("roster index out of bounds");
    }
}

struct ErroringHandler;

#[async_trait]
impl RetryHandler for ErroringHandler {
    async fn retry(&self, _job: &FailedJob, _now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        Err(AppError::ServiceUnavailable)
    }
}

/// Resolves the job by hand while its retry is still running.
#[derive(Default)]
struct OperatorRaceHandler {
    ledger: OnceLock<Arc<FailedJobLedger>>,
}

#[async_trait]
impl RetryHandler for OperatorRaceHandler {
    async fn retry(&self, job: &FailedJob, now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let ledger = self.ledger.get().expect("ledger wired");
        ledger
            .resolve(&job.id, "fixed the roster by hand", now + Duration::hours(1))
            .await?;
        Ok(RetryOutcome::failure("upstream unavailable"))
    }
}

/// Overruns its claim lease; another worker claims the next attempt meanwhile.
#[derive(Default)]
struct LeaseOverrunHandler {
    ledger: OnceLock<Arc<FailedJobLedger>>,
}

#[async_trait]
impl RetryHandler for LeaseOverrunHandler {
    async fn retry(&self, job: &FailedJob, now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let ledger = self.ledger.get().expect("ledger wired");
        let later = now + Duration::minutes(20);
        let expected = ClaimExpectation {
            status: job.status,
            attempt_count: job.attempt_count,
        };
        ledger
            .store()
            .claim(&job.id, expected, later, later + Duration::minutes(15))
            .await?
            .expect("lease expired, so the next attempt can be claimed");
        Ok(RetryOutcome::success("synced late"))
    }
}

fn harness_with(job_type: &str, handler: Arc<dyn RetryHandler>) -> Harness {
    let mut registry = HandlerRegistry::new();
    registry.register(job_type, handler);
    Harness::with_registry(registry)
}

async fn record(h: &Harness, job_type: &str, at: DateTime<Utc>) -> FailedJob {
    h.engine
        .ledger
        .record_failure_at(job_type, "initial run failed", json!({}), Vec::new(), at)
        .await
        .unwrap()
}

#[tokio::test]
async fn job_resolves_when_third_attempt_succeeds() {
    let handler = ScriptedHandler::new(1);
    let h = harness_with(SYNC_JOB, handler.clone());
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.next_retry_at, Some(t0 + Duration::minutes(30)));

    // Attempt 2 fails and is rescheduled with a doubled delay.
    let t1 = t0 + Duration::minutes(30);
    let first = h.engine.worker.retry_due_jobs(t1).await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.failed, 1);

    let after_first = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(after_first.status, FailedJobStatus::Pending);
    assert_eq!(after_first.attempt_count, 2);
    assert_eq!(after_first.last_attempt_at, Some(t1));
    assert_eq!(after_first.next_retry_at, Some(t1 + Duration::minutes(60)));
    assert!(after_first.error_message.contains("upstream unavailable"));

    let too_early = h
        .engine
        .worker
        .retry_due_jobs(t1 + Duration::minutes(59))
        .await
        .unwrap();
    assert_eq!(too_early.retried, 0);

    // Attempt 3 succeeds.
    let t2 = t1 + Duration::minutes(60);
    let second = h.engine.worker.retry_due_jobs(t2).await.unwrap();
    assert_eq!(second.retried, 1);
    assert_eq!(second.succeeded, 1);

    let resolved = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(resolved.status, FailedJobStatus::Resolved);
    assert_eq!(resolved.attempt_count, 3);
    assert_eq!(resolved.resolved_at, Some(t2));
    assert_eq!(resolved.resolution.as_deref(), Some("synced"));
    assert_eq!(resolved.next_retry_at, None);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn exhausted_job_escalates_once_and_is_never_picked_again() {
    let handler = ScriptedHandler::new(u32::MAX);
    let h = harness_with(SYNC_JOB, handler.clone());
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;

    let t1 = t0 + Duration::minutes(30);
    h.engine.worker.retry_due_jobs(t1).await.unwrap();
    let t2 = t1 + Duration::minutes(60);
    let last = h.engine.worker.retry_due_jobs(t2).await.unwrap();
    assert_eq!(last.failed, 1);
    assert_eq!(last.max_attempts_reached, 1);

    let failed = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(failed.status, FailedJobStatus::Failed);
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(failed.next_retry_at, None);

    let later = h
        .engine
        .worker
        .retry_due_jobs(t2 + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(later.retried, 0);
    assert_eq!(handler.calls(), 2);

    let severities: Vec<Severity> = h
        .operators
        .alerts_for(&job.id)
        .into_iter()
        .map(|a| a.severity)
        .collect();
    assert_eq!(severities, vec![Severity::Warning, Severity::Critical]);
}

#[tokio::test]
async fn unknown_job_type_is_left_untouched() {
    let h = Harness::new();
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, "legacy_export", t0).await;

    let summary = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(summary.skipped_unknown, 1);
    assert_eq!(summary.retried, 0);

    let stored = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.status, FailedJobStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.next_retry_at, job.next_retry_at);
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_sweep() {
    let sync = ScriptedHandler::new(0);
    let mut registry = HandlerRegistry::new();
    registry
        .register("fragile_job", Arc::new(PanickingHandler))
        .register(SYNC_JOB, sync.clone());
    let h = Harness::with_registry(registry);

    let t0 = ts("2024-03-01T00:00:00Z");
    let fragile = record(&h, "fragile_job", t0).await;
    let healthy = record(&h, SYNC_JOB, t0 + Duration::seconds(1)).await;

    let summary = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let fragile = h.engine.ledger.get(&fragile.id).await.unwrap();
    assert_eq!(fragile.status, FailedJobStatus::Pending);
    assert_eq!(fragile.attempt_count, 2);
    assert!(fragile.error_message.contains("roster index out of bounds"));

    let healthy = h.engine.ledger.get(&healthy.id).await.unwrap();
    assert_eq!(healthy.status, FailedJobStatus::Resolved);
    assert_eq!(sync.calls(), 1);
}

#[tokio::test]
async fn handler_error_counts_as_failed_attempt() {
    let h = harness_with(SYNC_JOB, Arc::new(ErroringHandler));
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;

    let summary = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let stored = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.status, FailedJobStatus::Pending);
    assert_eq!(stored.attempt_count, 2);
    assert!(stored.error_message.contains("Service Unavailable"));
}

#[tokio::test]
async fn concurrent_workers_run_each_attempt_once() {
    let handler = ScriptedHandler::new(0);
    let mut registry = HandlerRegistry::new();
    registry.register(SYNC_JOB, handler.clone());
    let h = Harness::with_registry(registry.clone());
    let t0 = ts("2024-03-01T00:00:00Z");
    record(&h, SYNC_JOB, t0).await;

    let other = RetryWorker::new(
        h.engine.ledger.clone(),
        Arc::new(registry),
        10,
        Duration::minutes(15),
    );
    let now = t0 + Duration::hours(1);
    let (a, b) = tokio::join!(h.engine.worker.retry_due_jobs(now), other.retry_due_jobs(now));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.retried + b.retried, 1);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn stale_claim_is_rejected() {
    let h = Harness::new();
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;
    let expected = ClaimExpectation {
        status: job.status,
        attempt_count: job.attempt_count,
    };
    let store = h.engine.ledger.store();
    let now = t0 + Duration::hours(1);

    let claimed = store
        .claim(&job.id, expected, now, now + Duration::minutes(15))
        .await
        .unwrap()
        .expect("first claim wins");
    assert_eq!(claimed.status, FailedJobStatus::Retrying);
    assert_eq!(claimed.attempt_count, 2);

    let second = store
        .claim(&job.id, expected, now, now + Duration::minutes(15))
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn manual_resolution() {
    let handler = ScriptedHandler::new(u32::MAX);
    let h = harness_with(SYNC_JOB, handler);
    let t0 = ts("2024-03-01T00:00:00Z");
    let pending = record(&h, SYNC_JOB, t0).await;
    let exhausted = record(&h, SYNC_JOB, t0).await;

    let resolved = h
        .engine
        .ledger
        .resolve(&pending.id, "fixed the roster by hand", t0)
        .await
        .unwrap();
    assert_eq!(resolved.status, FailedJobStatus::Resolved);
    assert_eq!(resolved.resolution.as_deref(), Some("fixed the roster by hand"));

    // Only the second job is retried until it is exhausted.
    let t1 = t0 + Duration::minutes(30);
    h.engine.worker.retry_due_jobs(t1).await.unwrap();
    h.engine
        .worker
        .retry_due_jobs(t1 + Duration::minutes(60))
        .await
        .unwrap();
    let failed = h.engine.ledger.get(&exhausted.id).await.unwrap();
    assert_eq!(failed.status, FailedJobStatus::Failed);

    let listed = h
        .engine
        .ledger
        .list(&ListFailedJobsFilter {
            status: Some(FailedJobStatus::Failed),
            job_type: None,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, exhausted.id);

    let fixed = h
        .engine
        .ledger
        .resolve(&exhausted.id, "refunded manually", t1 + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(fixed.status, FailedJobStatus::Resolved);
    assert_eq!(fixed.attempt_count, 3);

    let again = h
        .engine
        .ledger
        .resolve(&exhausted.id, "twice", t1 + Duration::hours(3))
        .await;
    assert!(matches!(again, Err(AppError::FailedPrecondition(_))));

    let missing = h.engine.ledger.resolve("no-such-job", "x", t1).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn bulk_notification_retry_only_resends_failed_recipients() {
    let h = Harness::new();
    let t0 = ts("2024-03-01T00:00:00Z");
    h.put(aged_account("acc-1", "student", "basic", t0, 40));
    h.put(aged_account("acc-2", "teacher", "basic", t0, 40));
    h.put(aged_account("acc-3", "student", "basic", t0, 40));
    h.notifier.fail_for("acc-2");

    let entities = vec![
        AffectedEntity::failed("account", "acc-1", "timeout"),
        AffectedEntity::failed("account", "acc-2", "timeout"),
        AffectedEntity::failed("account", "acc-3", "timeout").succeeded(),
    ];
    let job = h
        .engine
        .ledger
        .record_failure_at(
            "bulk_notification",
            "2 of 3 notifications failed",
            json!({
                "title": "School closed",
                "message": "The school is closed on Friday.",
                "severity": "warning",
            }),
            entities,
            t0,
        )
        .await
        .unwrap();

    let t1 = t0 + Duration::minutes(30);
    let first = h.engine.worker.retry_due_jobs(t1).await.unwrap();
    assert_eq!(first.failed, 1);

    let stored = h.engine.ledger.get(&job.id).await.unwrap();
    let outcomes: Vec<(String, EntityOutcome)> = stored
        .affected_entities
        .iter()
        .map(|e| (e.entity_id.clone(), e.status))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("acc-1".to_string(), EntityOutcome::Succeeded),
            ("acc-2".to_string(), EntityOutcome::Failed),
            ("acc-3".to_string(), EntityOutcome::Succeeded),
        ]
    );

    h.notifier.recover("acc-2");
    let second = h
        .engine
        .worker
        .retry_due_jobs(t1 + Duration::minutes(60))
        .await
        .unwrap();
    assert_eq!(second.succeeded, 1);

    assert_eq!(h.notifier.sent_to("acc-1").len(), 1);
    assert_eq!(h.notifier.sent_to("acc-2").len(), 1);
    assert!(h.notifier.sent_to("acc-3").is_empty());
    let delivered = &h.notifier.sent_to("acc-2")[0];
    assert_eq!(delivered.title, "School closed");
    assert_eq!(delivered.severity, Severity::Warning);

    let resolved = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(resolved.status, FailedJobStatus::Resolved);
}

#[tokio::test]
async fn unknown_job_types_do_not_block_known_jobs() {
    let handler = ScriptedHandler::new(0);
    let mut registry = HandlerRegistry::new();
    registry.register(SYNC_JOB, handler.clone());
    let h = Harness::with_registry(registry.clone());
    let t0 = ts("2024-03-01T00:00:00Z");
    record(&h, "legacy_export", t0).await;
    record(&h, "legacy_export", t0).await;
    let sync = record(&h, SYNC_JOB, t0 + Duration::minutes(1)).await;

    let small_batch = RetryWorker::new(
        h.engine.ledger.clone(),
        Arc::new(registry),
        2,
        Duration::minutes(15),
    );
    let summary = small_batch
        .retry_due_jobs(t0 + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(summary.skipped_unknown, 2);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(handler.calls(), 1);

    let stored = h.engine.ledger.get(&sync.id).await.unwrap();
    assert_eq!(stored.status, FailedJobStatus::Resolved);
    assert_eq!(stored.attempt_count, 2);
}

#[tokio::test]
async fn abandoned_final_attempt_fails_and_escalates() {
    let handler = ScriptedHandler::new(0);
    let h = harness_with(SYNC_JOB, handler.clone());
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;
    let store = h.engine.ledger.store();

    // Attempt 2 is claimed and its lease runs out; attempt 3 is claimed by a
    // worker that never reports back.
    let t1 = t0 + Duration::minutes(30);
    let second = store
        .claim(
            &job.id,
            ClaimExpectation {
                status: FailedJobStatus::Pending,
                attempt_count: 1,
            },
            t1,
            t1 + Duration::minutes(15),
        )
        .await
        .unwrap()
        .expect("attempt 2 claimed");
    let t2 = t1 + Duration::minutes(20);
    let third = store
        .claim(
            &job.id,
            ClaimExpectation {
                status: FailedJobStatus::Retrying,
                attempt_count: second.attempt_count,
            },
            t2,
            t2 + Duration::minutes(15),
        )
        .await
        .unwrap()
        .expect("attempt 3 claimed");
    assert_eq!(third.attempt_count, 3);

    let inside_lease = h
        .engine
        .worker
        .retry_due_jobs(t2 + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(inside_lease.max_attempts_reached, 0);

    let summary = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(summary.retried, 0);
    assert_eq!(summary.max_attempts_reached, 1);
    assert_eq!(handler.calls(), 0);

    let failed = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(failed.status, FailedJobStatus::Failed);
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(failed.next_retry_at, None);
    assert!(failed.error_message.contains("never reported an outcome"));

    let severities: Vec<Severity> = h
        .operators
        .alerts_for(&job.id)
        .into_iter()
        .map(|a| a.severity)
        .collect();
    assert_eq!(severities, vec![Severity::Warning, Severity::Critical]);

    let again = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::days(31))
        .await
        .unwrap();
    assert_eq!(again.max_attempts_reached, 0);
}

#[tokio::test]
async fn retrying_job_is_resolvable_once_its_lease_expires() {
    let h = Harness::new();
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;
    let t1 = t0 + Duration::minutes(30);
    h.engine
        .ledger
        .store()
        .claim(
            &job.id,
            ClaimExpectation {
                status: job.status,
                attempt_count: job.attempt_count,
            },
            t1,
            t1 + Duration::minutes(15),
        )
        .await
        .unwrap()
        .expect("claimed");

    let busy = h
        .engine
        .ledger
        .resolve(&job.id, "fixed by hand", t1 + Duration::minutes(5))
        .await;
    assert!(matches!(busy, Err(AppError::FailedPrecondition(_))));

    let resolved = h
        .engine
        .ledger
        .resolve(&job.id, "fixed by hand", t1 + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!(resolved.status, FailedJobStatus::Resolved);
    assert_eq!(resolved.attempt_count, 2);
}

#[tokio::test]
async fn manual_resolution_during_retry_is_not_overwritten() {
    let handler = Arc::new(OperatorRaceHandler::default());
    let h = harness_with(SYNC_JOB, handler.clone());
    handler.ledger.set(h.engine.ledger.clone()).ok();
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;

    let summary = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.claim_conflicts, 1);

    let stored = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.status, FailedJobStatus::Resolved);
    assert_eq!(stored.resolution.as_deref(), Some("fixed the roster by hand"));
    assert_eq!(stored.next_retry_at, None);
}

#[tokio::test]
async fn overrunning_retry_loses_to_the_next_claim() {
    let handler = Arc::new(LeaseOverrunHandler::default());
    let h = harness_with(SYNC_JOB, handler.clone());
    handler.ledger.set(h.engine.ledger.clone()).ok();
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;

    let summary = h
        .engine
        .worker
        .retry_due_jobs(t0 + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.claim_conflicts, 1);

    // The later claim still owns the job.
    let stored = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.status, FailedJobStatus::Retrying);
    assert_eq!(stored.attempt_count, 3);
    assert_eq!(stored.resolution, None);
}

#[tokio::test]
async fn stale_write_is_refused() {
    let h = Harness::new();
    let t0 = ts("2024-03-01T00:00:00Z");
    let job = record(&h, SYNC_JOB, t0).await;
    let store = h.engine.ledger.store();
    let read = ClaimExpectation {
        status: job.status,
        attempt_count: job.attempt_count,
    };
    let now = t0 + Duration::minutes(30);
    store
        .claim(&job.id, read, now, now + Duration::minutes(15))
        .await
        .unwrap()
        .expect("claimed");

    let mut resolved = job.clone();
    resolved.status = FailedJobStatus::Resolved;
    resolved.resolved_at = Some(now);
    assert!(!store.update(&resolved, read).await.unwrap());

    let stored = h.engine.ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.status, FailedJobStatus::Retrying);
    assert_eq!(stored.attempt_count, 2);
}
