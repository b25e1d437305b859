//! Payment reminders for pending invoices.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::models::{AffectedEntity, Invoice, InvoiceStatus};
use crate::retry::{job_types, FailedJobLedger};
use crate::services::metrics::record_notification_failure;
use crate::services::notifier::{Notification, NotificationSender, Severity};
use crate::services::store::{AccountStore, InvoiceStore};

pub const INVOICE_ENTITY: &str = "invoice";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSummary {
    pub checked: u32,
    pub sent: u32,
    pub failed: u32,
    /// Invoices no longer pending by the time the reminder went out.
    pub skipped: u32,
    pub failed_job_id: Option<String>,
}

/// Outcome of reminding one invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderResult {
    Sent,
    NotNeeded,
}

pub struct ReminderService {
    accounts: Arc<dyn AccountStore>,
    invoices: Arc<dyn InvoiceStore>,
    notifier: Arc<dyn NotificationSender>,
    ledger: Arc<FailedJobLedger>,
    window: Duration,
}

impl ReminderService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        invoices: Arc<dyn InvoiceStore>,
        notifier: Arc<dyn NotificationSender>,
        ledger: Arc<FailedJobLedger>,
        window: Duration,
    ) -> Self {
        Self {
            accounts,
            invoices,
            notifier,
            ledger,
            window,
        }
    }

    /// Remind the owners of pending invoices due within the reminder window.
    /// Failed deliveries are collected into one `payment_reminder` job.
    #[instrument(skip(self))]
    pub async fn send_payment_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReminderSummary, AppError> {
        let pending = self.invoices.find_pending(now + self.window).await?;

        let mut summary = ReminderSummary::default();
        let mut failures = Vec::new();
        for invoice in &pending {
            summary.checked += 1;
            match self.remind(invoice, now).await {
                Ok(ReminderResult::Sent) => summary.sent += 1,
                Ok(ReminderResult::NotNeeded) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    failures.push(AffectedEntity::failed(INVOICE_ENTITY, &invoice.id, e));
                }
            }
        }

        if !failures.is_empty() {
            let error = format!(
                "{} of {} payment reminders failed",
                failures.len(),
                summary.checked
            );
            let metadata = json!({
                "checked": summary.checked,
                "sent": summary.sent,
                "failed": summary.failed,
                "as_of": now.to_rfc3339(),
            });
            match self
                .ledger
                .record_failure(job_types::PAYMENT_REMINDER, &error, metadata, failures)
                .await
            {
                Ok(job) => summary.failed_job_id = Some(job.id),
                Err(e) => error!(error = %e, "Failed to record payment reminder failures"),
            }
        }

        info!(
            checked = summary.checked,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "Payment reminders sent"
        );
        Ok(summary)
    }

    /// Re-send the reminder for one invoice by id. Used by the retry handler.
    pub async fn remind_invoice(
        &self,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReminderResult, String> {
        let invoice = self
            .invoices
            .find_by_id(invoice_id)
            .await
            .map_err(|e| e.to_string())?;
        match invoice {
            Some(invoice) => self.remind(&invoice, now).await,
            None => Ok(ReminderResult::NotNeeded),
        }
    }

    async fn remind(&self, invoice: &Invoice, now: DateTime<Utc>) -> Result<ReminderResult, String> {
        if !matches!(invoice.status, InvoiceStatus::Pending | InvoiceStatus::Overdue)
            || invoice.outstanding() == 0
        {
            return Ok(ReminderResult::NotNeeded);
        }

        let account = self
            .accounts
            .find_by_id(&invoice.account_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Account {} not found", invoice.account_id))?;

        let overdue = invoice.due_date < now;
        let notification = Notification {
            title: if overdue {
                "Payment overdue".to_string()
            } else {
                "Payment reminder".to_string()
            },
            message: format!(
                "Invoice {} for {} has {} {} outstanding, due {}.",
                invoice.id,
                invoice.billing_period,
                invoice.outstanding(),
                invoice.currency,
                invoice.due_date.format("%Y-%m-%d")
            ),
            severity: if overdue {
                Severity::Warning
            } else {
                Severity::Info
            },
            action_ref: Some(invoice.id.clone()),
        };

        self.notifier
            .notify(&account, &notification)
            .await
            .map_err(|e| {
                warn!(invoice_id = %invoice.id, error = %e, "Payment reminder failed");
                record_notification_failure("reminder");
                e.to_string()
            })?;
        Ok(ReminderResult::Sent)
    }
}
