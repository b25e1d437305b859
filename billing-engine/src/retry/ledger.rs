//! Failed-job ledger.

use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::registry::BackoffPolicy;
use crate::models::{AffectedEntity, FailedJob, FailedJobStatus, ListFailedJobsFilter};
use crate::services::metrics::record_failed_job;
use crate::services::notifier::{OperatorAlert, OperatorChannel, Severity};
use crate::services::store::{ClaimExpectation, FailedJobStore};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Records job failures and exposes them to operators.
pub struct FailedJobLedger {
    store: Arc<dyn FailedJobStore>,
    operators: Arc<dyn OperatorChannel>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl FailedJobLedger {
    pub fn new(
        store: Arc<dyn FailedJobStore>,
        operators: Arc<dyn OperatorChannel>,
        policy: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            operators,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn FailedJobStore> {
        &self.store
    }

    pub fn operators(&self) -> &Arc<dyn OperatorChannel> {
        &self.operators
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Record a failed job, scheduled for its first retry, and tell the
    /// operators about it.
    pub async fn record_failure(
        &self,
        job_type: &str,
        error: &str,
        metadata: Value,
        affected_entities: Vec<AffectedEntity>,
    ) -> Result<FailedJob, AppError> {
        self.record_failure_at(job_type, error, metadata, affected_entities, Utc::now())
            .await
    }

    #[instrument(skip(self, metadata, affected_entities), fields(entities = affected_entities.len()))]
    pub async fn record_failure_at(
        &self,
        job_type: &str,
        error: &str,
        metadata: Value,
        affected_entities: Vec<AffectedEntity>,
        now: DateTime<Utc>,
    ) -> Result<FailedJob, AppError> {
        let job = FailedJob {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            scheduled_time: now,
            attempt_count: 1,
            max_attempts: self.max_attempts,
            last_attempt_at: Some(now),
            next_retry_at: Some(now + self.policy.initial_delay()),
            status: FailedJobStatus::Pending,
            error_message: error.to_string(),
            affected_entities,
            metadata,
            resolved_at: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(&job).await?;
        record_failed_job(job_type);
        info!(job_id = %job.id, next_retry_at = ?job.next_retry_at, "Failed job recorded");

        let alert = OperatorAlert {
            severity: Severity::Warning,
            subject: format!("{} failed", job_type),
            message: format!(
                "{} failed and will be retried up to {} times: {}",
                job_type, job.max_attempts, error
            ),
            reference: Some(job.id.clone()),
        };
        if let Err(e) = self.operators.notify_operators(&alert).await {
            warn!(job_id = %job.id, error = %e, "Failed to notify operators of job failure");
        }

        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<FailedJob, AppError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Failed job {} not found", id)))
    }

    pub async fn list(&self, filter: &ListFailedJobsFilter) -> Result<Vec<FailedJob>, AppError> {
        self.store.list(filter).await
    }

    /// Manually resolve a pending or failed job, or one whose retry lease
    /// ran out without an outcome.
    #[instrument(skip(self, resolution))]
    pub async fn resolve(
        &self,
        id: &str,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> Result<FailedJob, AppError> {
        let mut job = self.get(id).await?;
        match job.status {
            FailedJobStatus::Pending | FailedJobStatus::Failed => {}
            FailedJobStatus::Retrying if job.lease_expired(now) => {}
            FailedJobStatus::Retrying => {
                return Err(AppError::FailedPrecondition(anyhow::anyhow!(
                    "Failed job {} is being retried",
                    id
                )))
            }
            FailedJobStatus::Resolved => {
                return Err(AppError::FailedPrecondition(anyhow::anyhow!(
                    "Failed job {} is already resolved",
                    id
                )))
            }
        }

        let expected = ClaimExpectation {
            status: job.status,
            attempt_count: job.attempt_count,
        };
        job.status = FailedJobStatus::Resolved;
        job.resolved_at = Some(now);
        job.resolution = Some(resolution.to_string());
        job.next_retry_at = None;
        job.updated_at = now;
        if !self.store.update(&job, expected).await? {
            return Err(AppError::FailedPrecondition(anyhow::anyhow!(
                "Failed job {} changed while being resolved",
                id
            )));
        }

        info!(job_id = %job.id, "Failed job resolved manually");
        Ok(job)
    }
}
