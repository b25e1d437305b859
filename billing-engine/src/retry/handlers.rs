//! Built-in retry handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;

use super::registry::{RetryHandler, RetryOutcome};
use crate::billing::{
    AccountOutcome, BillingCycleProcessor, OverdueSweeper, ReminderResult, ReminderService,
};
use crate::models::{AffectedEntity, EntityOutcome, FailedJob, RunMode, SkipReason};
use crate::services::notifier::{Notification, NotificationSender, Severity};
use crate::services::store::AccountStore;

/// Re-bills the single account recorded on a `monthly_billing` or
/// `annual_billing` job.
pub struct BillingRetryHandler {
    processor: Arc<BillingCycleProcessor>,
}

impl BillingRetryHandler {
    pub fn new(processor: Arc<BillingCycleProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl RetryHandler for BillingRetryHandler {
    async fn retry(&self, job: &FailedJob, now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let account_id = job.metadata_str("account_id").ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Job {} has no account_id", job.id))
        })?;
        let as_of = match job.metadata_str("as_of") {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid as_of {}: {}", raw, e)))?
                .with_timezone(&Utc),
            None => now,
        };

        let entity = |status: EntityOutcome, error: Option<String>| AffectedEntity {
            entity_id: account_id.to_string(),
            entity_type: "account".to_string(),
            status,
            error,
        };

        match self.processor.bill_account(account_id, as_of, RunMode::Live).await {
            Ok(AccountOutcome::Billed { invoice, .. }) => Ok(RetryOutcome::success(format!(
                "invoice {} created for {}",
                invoice.invoice_id, invoice.billing_period
            ))
            .with_entities(vec![entity(EntityOutcome::Succeeded, None)])),
            Ok(AccountOutcome::Skipped(SkipReason::AlreadyInvoiced)) => Ok(RetryOutcome::success(
                "invoice already exists for the period",
            )
            .with_entities(vec![entity(EntityOutcome::Succeeded, None)])),
            Ok(AccountOutcome::Skipped(SkipReason::NotDue)) => Ok(RetryOutcome::success(
                "account no longer due for the period",
            )
            .with_entities(vec![entity(EntityOutcome::Succeeded, None)])),
            Ok(AccountOutcome::Ineligible(reason)) => Ok(RetryOutcome::success(format!(
                "account no longer billable: {}",
                reason
            ))
            .with_entities(vec![entity(EntityOutcome::Succeeded, None)])),
            Err(AppError::NotFound(e)) => Ok(RetryOutcome::success(format!(
                "nothing to bill: {}",
                e
            ))),
            Err(e) => Ok(RetryOutcome::failure(e.to_string())
                .with_entities(vec![entity(EntityOutcome::Failed, Some(e.to_string()))])),
        }
    }
}

/// Re-sends the reminders that failed on a `payment_reminder` job.
pub struct ReminderRetryHandler {
    reminders: Arc<ReminderService>,
}

impl ReminderRetryHandler {
    pub fn new(reminders: Arc<ReminderService>) -> Self {
        Self { reminders }
    }
}

#[async_trait]
impl RetryHandler for ReminderRetryHandler {
    async fn retry(&self, job: &FailedJob, now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let mut entities = Vec::with_capacity(job.affected_entities.len());
        let mut failed = 0usize;

        for entity in &job.affected_entities {
            if entity.status == EntityOutcome::Succeeded {
                entities.push(entity.clone());
                continue;
            }
            match self.reminders.remind_invoice(&entity.entity_id, now).await {
                Ok(ReminderResult::Sent) | Ok(ReminderResult::NotNeeded) => {
                    entities.push(entity.clone().succeeded())
                }
                Err(e) => {
                    failed += 1;
                    entities.push(AffectedEntity::failed(
                        &entity.entity_type,
                        &entity.entity_id,
                        e,
                    ));
                }
            }
        }

        let outcome = if failed == 0 {
            RetryOutcome::success(format!("{} reminders delivered", entities.len()))
        } else {
            RetryOutcome::failure(format!(
                "{} of {} payment reminders still failing",
                failed,
                entities.len()
            ))
        };
        Ok(outcome.with_entities(entities))
    }
}

/// Re-sweeps the invoices that failed on an `overdue_sweep` job.
pub struct OverdueRetryHandler {
    sweeper: Arc<OverdueSweeper>,
}

impl OverdueRetryHandler {
    pub fn new(sweeper: Arc<OverdueSweeper>) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl RetryHandler for OverdueRetryHandler {
    async fn retry(&self, job: &FailedJob, now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let mut entities = Vec::with_capacity(job.affected_entities.len());
        let mut failed = 0usize;

        for entity in &job.affected_entities {
            if entity.status == EntityOutcome::Succeeded {
                entities.push(entity.clone());
                continue;
            }
            match self.sweeper.sweep_invoice_by_id(&entity.entity_id, now).await {
                Ok(_) => entities.push(entity.clone().succeeded()),
                Err(e) => {
                    failed += 1;
                    entities.push(AffectedEntity::failed(
                        &entity.entity_type,
                        &entity.entity_id,
                        e.to_string(),
                    ));
                }
            }
        }

        let outcome = if failed == 0 {
            RetryOutcome::success(format!("{} overdue invoices swept", entities.len()))
        } else {
            RetryOutcome::failure(format!(
                "{} of {} overdue invoices still failing",
                failed,
                entities.len()
            ))
        };
        Ok(outcome.with_entities(entities))
    }
}

/// Re-sends a broadcast to the accounts it failed for. The job metadata
/// carries `title`, `message` and optionally `severity`; entities are
/// account ids.
pub struct BulkNotificationHandler {
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<dyn NotificationSender>,
}

impl BulkNotificationHandler {
    pub fn new(accounts: Arc<dyn AccountStore>, notifier: Arc<dyn NotificationSender>) -> Self {
        Self { accounts, notifier }
    }
}

#[async_trait]
impl RetryHandler for BulkNotificationHandler {
    async fn retry(&self, job: &FailedJob, _now: DateTime<Utc>) -> Result<RetryOutcome, AppError> {
        let (Some(title), Some(message)) = (job.metadata_str("title"), job.metadata_str("message"))
        else {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Job {} is missing title or message",
                job.id
            )));
        };
        let notification = Notification {
            title: title.to_string(),
            message: message.to_string(),
            severity: match job.metadata_str("severity") {
                Some("warning") => Severity::Warning,
                Some("critical") => Severity::Critical,
                _ => Severity::Info,
            },
            action_ref: job.metadata_str("action_ref").map(str::to_string),
        };

        let mut entities = Vec::with_capacity(job.affected_entities.len());
        let mut failed = 0usize;
        for entity in &job.affected_entities {
            if entity.status == EntityOutcome::Succeeded {
                entities.push(entity.clone());
                continue;
            }
            let result = match self.accounts.find_by_id(&entity.entity_id).await {
                Ok(Some(account)) => self
                    .notifier
                    .notify(&account, &notification)
                    .await
                    .map_err(|e| e.to_string()),
                // Deleted accounts have nobody left to notify.
                Ok(None) => Ok(()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => entities.push(entity.clone().succeeded()),
                Err(e) => {
                    failed += 1;
                    entities.push(AffectedEntity::failed(
                        &entity.entity_type,
                        &entity.entity_id,
                        e,
                    ));
                }
            }
        }

        let outcome = if failed == 0 {
            RetryOutcome::success(format!("{} notifications delivered", entities.len()))
        } else {
            RetryOutcome::failure(format!(
                "{} of {} notifications still failing",
                failed,
                entities.len()
            ))
        };
        Ok(outcome.with_entities(entities))
    }
}
