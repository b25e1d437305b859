//! Overdue sweep: pending invoices past their due date become overdue and
//! the owning account is re-classified.
//!
//! The account is updated before the invoice leaves `pending`, so an
//! invoice whose account update failed is still picked up by the next sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::reminders::INVOICE_ENTITY;
use super::status::{classify, plan_transition};
use crate::models::{AffectedEntity, Invoice, InvoiceStatus};
use crate::retry::{job_types, FailedJobLedger};
use crate::services::metrics::record_overdue_invoice;
use crate::services::store::{AccountStore, InvoiceStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueSummary {
    pub checked: u32,
    pub marked_overdue: u32,
    pub accounts_updated: u32,
    pub failed: u32,
    pub failed_job_id: Option<String>,
}

/// What sweeping one invoice changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvoiceSweep {
    pub marked_overdue: bool,
    pub account_updated: bool,
}

pub struct OverdueSweeper {
    accounts: Arc<dyn AccountStore>,
    invoices: Arc<dyn InvoiceStore>,
    ledger: Arc<FailedJobLedger>,
}

impl OverdueSweeper {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        invoices: Arc<dyn InvoiceStore>,
        ledger: Arc<FailedJobLedger>,
    ) -> Self {
        Self {
            accounts,
            invoices,
            ledger,
        }
    }

    /// Sweep every pending invoice due before `now`. Invoices that fail are
    /// collected into one `overdue_sweep` job.
    #[instrument(skip(self))]
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<OverdueSummary, AppError> {
        let pending = self.invoices.find_pending(now).await?;

        let mut summary = OverdueSummary::default();
        let mut failures = Vec::new();
        for invoice in &pending {
            summary.checked += 1;
            match self.sweep_invoice(invoice, now).await {
                Ok(sweep) => {
                    if sweep.marked_overdue {
                        summary.marked_overdue += 1;
                    }
                    if sweep.account_updated {
                        summary.accounts_updated += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(invoice_id = %invoice.id, error = %e, "Overdue sweep failed for invoice");
                    failures.push(AffectedEntity::failed(INVOICE_ENTITY, &invoice.id, e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            let error = format!(
                "{} of {} overdue invoices could not be swept",
                failures.len(),
                summary.checked
            );
            let metadata = json!({
                "checked": summary.checked,
                "failed": summary.failed,
                "as_of": now.to_rfc3339(),
            });
            match self
                .ledger
                .record_failure(job_types::OVERDUE_SWEEP, &error, metadata, failures)
                .await
            {
                Ok(job) => summary.failed_job_id = Some(job.id),
                Err(e) => error!(error = %e, "Failed to record overdue sweep failures"),
            }
        }

        info!(
            checked = summary.checked,
            marked_overdue = summary.marked_overdue,
            accounts_updated = summary.accounts_updated,
            failed = summary.failed,
            "Overdue sweep completed"
        );
        Ok(summary)
    }

    /// Re-sweep one invoice by id. Used by the retry handler; an invoice that
    /// is gone, settled or no longer pending needs nothing.
    pub async fn sweep_invoice_by_id(
        &self,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<InvoiceSweep, AppError> {
        match self.invoices.find_by_id(invoice_id).await? {
            Some(invoice) if invoice.status == InvoiceStatus::Pending && invoice.due_date < now => {
                self.sweep_invoice(&invoice, now).await
            }
            _ => Ok(InvoiceSweep::default()),
        }
    }

    async fn sweep_invoice(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<InvoiceSweep, AppError> {
        let mut sweep = InvoiceSweep::default();

        match self.accounts.find_by_id(&invoice.account_id).await? {
            Some(account) => {
                let classification = classify(
                    account.role(),
                    invoice.amount_paid,
                    invoice.amount,
                    Some(invoice.due_date),
                    now,
                );
                let update = plan_transition(account.account_status, classification)
                    .map_err(|e| AppError::FailedPrecondition(anyhow::anyhow!(e)))?;

                if update.account_changed || update.payment_status != account.payment_status {
                    self.accounts
                        .update_status(&account.id, update.account_status, update.payment_status)
                        .await?;
                    sweep.account_updated = true;
                    info!(
                        account_id = %account.id,
                        from = %account.account_status,
                        to = %update.account_status,
                        payment_status = %update.payment_status,
                        "Account status updated after overdue invoice"
                    );
                }
            }
            None => {
                warn!(invoice_id = %invoice.id, account_id = %invoice.account_id, "Overdue invoice has no account");
            }
        }

        sweep.marked_overdue = self.invoices.mark_overdue(&invoice.id, now).await?;
        if sweep.marked_overdue {
            record_overdue_invoice(invoice.invoice_type.as_str());
        }
        Ok(sweep)
    }
}
