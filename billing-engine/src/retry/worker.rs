//! Retry worker.
//!
//! Picks up due failed jobs, claims each one with a compare-and-set so that
//! concurrent workers never run the same attempt, and dispatches it to the
//! handler registered for its job type.

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use service_core::error::AppError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::ledger::FailedJobLedger;
use super::registry::{HandlerRegistry, RetryOutcome};
use crate::models::{FailedJob, FailedJobStatus, RetrySummary};
use crate::services::metrics::{record_error, record_retry_outcome};
use crate::services::notifier::{OperatorAlert, Severity};
use crate::services::store::{ClaimExpectation, JobTypeFilter};

pub struct RetryWorker {
    ledger: Arc<FailedJobLedger>,
    registry: Arc<HandlerRegistry>,
    batch_size: i64,
    claim_lease: Duration,
}

impl RetryWorker {
    pub fn new(
        ledger: Arc<FailedJobLedger>,
        registry: Arc<HandlerRegistry>,
        batch_size: i64,
        claim_lease: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            batch_size: batch_size.max(1),
            claim_lease,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Retry every job due at `now`, up to the batch size.
    ///
    /// Due jobs of unregistered types are reported but never claimed, and are
    /// queried separately so they cannot crowd known jobs out of the batch.
    #[instrument(skip(self), fields(batch_size = self.batch_size))]
    pub async fn retry_due_jobs(&self, now: DateTime<Utc>) -> Result<RetrySummary, AppError> {
        let store = self.ledger.store();
        let known: Vec<String> = self
            .registry
            .job_types()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut summary = RetrySummary::default();
        self.fail_abandoned_claims(now, &mut summary).await?;

        let unknown = store
            .find_due(now, JobTypeFilter::Except(&known), self.batch_size)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load due jobs of unregistered types");
                record_error("database", "retry_due_jobs");
                e
            })?;
        for job in &unknown {
            // Left untouched so it stays visible to operators.
            warn!(job_id = %job.id, job_type = %job.job_type, "No retry handler registered for job type");
            summary.skipped_unknown += 1;
            record_retry_outcome(&job.job_type, "unknown_type");
        }

        let due = store
            .find_due(now, JobTypeFilter::Only(&known), self.batch_size)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load due jobs");
                record_error("database", "retry_due_jobs");
                e
            })?;

        for job in due {
            let Some(handler) = self.registry.get(&job.job_type) else {
                continue;
            };

            let expected = ClaimExpectation {
                status: job.status,
                attempt_count: job.attempt_count,
            };
            let claimed = match store
                .claim(&job.id, expected, now, now + self.claim_lease)
                .await
            {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    info!(job_id = %job.id, "Job claimed by another worker");
                    summary.claim_conflicts += 1;
                    continue;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to claim job");
                    record_error("database", "claim_failed_job");
                    continue;
                }
            };
            summary.retried += 1;

            let outcome = match AssertUnwindSafe(handler.retry(&claimed, now))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => RetryOutcome::failure(e.to_string()),
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(job_id = %claimed.id, panic = %detail, "Retry handler panicked");
                    RetryOutcome::failure(format!("handler panicked: {}", detail))
                }
            };

            self.apply_outcome(claimed, outcome, now, &mut summary).await;
        }

        info!(
            retried = summary.retried,
            succeeded = summary.succeeded,
            failed = summary.failed,
            max_attempts_reached = summary.max_attempts_reached,
            skipped_unknown = summary.skipped_unknown,
            claim_conflicts = summary.claim_conflicts,
            "Retry sweep completed"
        );
        Ok(summary)
    }

    /// Move final attempts whose worker died mid-retry to `failed`.
    async fn fail_abandoned_claims(
        &self,
        now: DateTime<Utc>,
        summary: &mut RetrySummary,
    ) -> Result<(), AppError> {
        let store = self.ledger.store();
        let abandoned = store
            .find_expired_claims(now, self.batch_size)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load expired claims");
                record_error("database", "find_expired_claims");
                e
            })?;

        for mut job in abandoned {
            let expected = ClaimExpectation {
                status: FailedJobStatus::Retrying,
                attempt_count: job.attempt_count,
            };
            job.status = FailedJobStatus::Failed;
            job.next_retry_at = None;
            job.updated_at = now;
            job.error_message = format!(
                "attempt {} never reported an outcome; last error: {}",
                job.attempt_count, job.error_message
            );

            match store.update(&job, expected).await {
                Ok(true) => {
                    summary.max_attempts_reached += 1;
                    record_retry_outcome(&job.job_type, "abandoned");
                    error!(job_id = %job.id, attempts = job.attempt_count, "Final retry attempt abandoned, job failed");
                    self.escalate(&job).await;
                }
                Ok(false) => {
                    info!(job_id = %job.id, "Expired claim changed concurrently");
                    summary.claim_conflicts += 1;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to fail abandoned job");
                    record_error("database", "update_failed_job");
                }
            }
        }
        Ok(())
    }

    async fn apply_outcome(
        &self,
        mut job: FailedJob,
        outcome: RetryOutcome,
        now: DateTime<Utc>,
        summary: &mut RetrySummary,
    ) {
        let expected = ClaimExpectation {
            status: FailedJobStatus::Retrying,
            attempt_count: job.attempt_count,
        };
        if let Some(entities) = outcome.affected_entities {
            job.affected_entities = entities;
        }
        job.updated_at = now;

        if outcome.succeeded {
            job.status = FailedJobStatus::Resolved;
            job.resolved_at = Some(now);
            job.resolution = Some(outcome.message);
            job.next_retry_at = None;
        } else {
            job.error_message = outcome.message;
            if job.attempt_count >= job.max_attempts {
                job.status = FailedJobStatus::Failed;
                job.next_retry_at = None;
            } else {
                job.status = FailedJobStatus::Pending;
                job.next_retry_at =
                    Some(now + self.ledger.policy().delay_for(job.attempt_count));
            }
        }

        match self.ledger.store().update(&job, expected).await {
            Ok(true) => {}
            Ok(false) => {
                // Resolved by an operator, or re-claimed after the lease ran out.
                warn!(job_id = %job.id, attempt = job.attempt_count, "Job changed while its retry ran, outcome discarded");
                summary.claim_conflicts += 1;
                record_retry_outcome(&job.job_type, "conflict");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to persist retry outcome");
                record_error("database", "update_failed_job");
                return;
            }
        }

        match job.status {
            FailedJobStatus::Resolved => {
                summary.succeeded += 1;
                record_retry_outcome(&job.job_type, "succeeded");
                info!(job_id = %job.id, attempt = job.attempt_count, "Retry succeeded");
            }
            FailedJobStatus::Failed => {
                summary.failed += 1;
                summary.max_attempts_reached += 1;
                record_retry_outcome(&job.job_type, "exhausted");
                error!(job_id = %job.id, attempts = job.attempt_count, error = %job.error_message, "Job failed permanently");
                self.escalate(&job).await;
            }
            _ => {
                summary.failed += 1;
                record_retry_outcome(&job.job_type, "failed");
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    next_retry_at = ?job.next_retry_at,
                    error = %job.error_message,
                    "Retry failed, rescheduled"
                );
            }
        }
    }

    async fn escalate(&self, job: &FailedJob) {
        let alert = OperatorAlert {
            severity: Severity::Critical,
            subject: format!("{} permanently failed", job.job_type),
            message: format!(
                "{} failed after {} attempts and needs manual action: {}",
                job.job_type, job.attempt_count, job.error_message
            ),
            reference: Some(job.id.clone()),
        };
        if let Err(e) = self.ledger.operators().notify_operators(&alert).await {
            error!(job_id = %job.id, error = %e, "Failed to escalate permanently failed job");
        }
    }
}
