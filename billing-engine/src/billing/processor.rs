//! Billing cycle processor.
//!
//! Issues at most one recurring invoice per account, billing type and
//! billing period. The unique index on invoices is what makes overlapping
//! runs safe; the due check and the existing-invoice lookup only keep the
//! common path cheap.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::period::{BillingCycle, MONTHLY_CYCLE_DAYS};
use super::pricing::PricingCatalog;
use crate::models::{
    Account, AccountFailure, AccountStatus, AffectedEntity, BillingFieldsUpdate,
    BillingRunSummary, Invoice, InvoiceMetadata, InvoiceRef, Role, RunMode, SkipReason,
};
use crate::retry::FailedJobLedger;
use crate::services::metrics::{
    record_account_outcome, record_billing_run, record_error, record_invoice_created,
    record_notification_failure,
};
use crate::services::notifier::{Notification, NotificationSender, Severity};
use crate::services::store::{AccountStore, BillingRunStore, BillingSelection, InvoiceStore};

/// Result of billing one account.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountOutcome {
    Billed {
        invoice: InvoiceRef,
        notification_failed: bool,
    },
    Skipped(SkipReason),
    /// The account is not (or no longer) subject to recurring billing.
    Ineligible(String),
}

pub struct BillingCycleProcessor {
    accounts: Arc<dyn AccountStore>,
    invoices: Arc<dyn InvoiceStore>,
    runs: Arc<dyn BillingRunStore>,
    notifier: Arc<dyn NotificationSender>,
    ledger: Arc<FailedJobLedger>,
    catalog: PricingCatalog,
    currency: String,
}

impl BillingCycleProcessor {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        invoices: Arc<dyn InvoiceStore>,
        runs: Arc<dyn BillingRunStore>,
        notifier: Arc<dyn NotificationSender>,
        ledger: Arc<FailedJobLedger>,
        currency: &str,
    ) -> Self {
        Self {
            accounts,
            invoices,
            runs,
            notifier,
            ledger,
            catalog: PricingCatalog::new(),
            currency: currency.to_string(),
        }
    }

    pub fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    fn selection(&self, as_of: DateTime<Utc>) -> BillingSelection {
        BillingSelection {
            roles: Role::payment_required()
                .iter()
                .map(|r| r.as_str().to_string())
                .collect(),
            package_types: self
                .catalog
                .recurring_packages()
                .into_iter()
                .map(str::to_string)
                .collect(),
            created_before: as_of - Duration::days(MONTHLY_CYCLE_DAYS),
        }
    }

    /// Bill every eligible account as of `as_of`.
    ///
    /// Only a failed account selection aborts the run. Per-account errors
    /// are counted and, in live mode, written to the failed-job ledger.
    #[instrument(skip(self, mode), fields(mode = mode.as_str()))]
    pub async fn run_billing_cycle(
        &self,
        as_of: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<BillingRunSummary, AppError> {
        let run_id = Uuid::new_v4().to_string();
        let mut summary = BillingRunSummary::new(run_id.clone(), mode, as_of, Utc::now());

        let accounts = self
            .accounts
            .find_due_for_billing(&self.selection(as_of))
            .await
            .map_err(|e| {
                error!(run_id = %run_id, error = %e, "Account selection failed, aborting billing run");
                record_billing_run(mode.as_str(), "aborted");
                record_error("database", "find_due_for_billing");
                e
            })?;

        info!(run_id = %run_id, accounts = accounts.len(), "Billing run started");

        for account in &accounts {
            summary.record_checked(&account.package_type, &account.role);

            let Some((cycle, amount)) = self
                .catalog
                .recurring_fee(account.role(), &account.package_type)
            else {
                summary.record_skipped(&account.package_type, &account.role, SkipReason::NotDue);
                continue;
            };

            match self
                .bill(account, cycle, amount, as_of, mode, Some(&run_id))
                .await
            {
                Ok(AccountOutcome::Billed {
                    invoice,
                    notification_failed,
                }) => {
                    if notification_failed {
                        summary.notification_failures += 1;
                    }
                    summary.record_billed(&account.package_type, &account.role, invoice);
                }
                Ok(AccountOutcome::Skipped(reason)) => {
                    summary.record_skipped(&account.package_type, &account.role, reason);
                }
                Ok(AccountOutcome::Ineligible(_)) => {
                    summary.record_skipped(&account.package_type, &account.role, SkipReason::NotDue);
                }
                Err(e) => {
                    record_account_outcome(cycle.as_str(), "failed");
                    warn!(account_id = %account.id, error = %e, "Billing failed for account");

                    let failed_job_id = if mode.is_live() {
                        self.record_account_failure(account, cycle, as_of, &e, &mut summary)
                            .await
                    } else {
                        None
                    };
                    summary.record_failed(
                        &account.package_type,
                        &account.role,
                        AccountFailure {
                            account_id: account.id.clone(),
                            error: e.to_string(),
                            failed_job_id,
                        },
                    );
                }
            }
        }

        summary.completed_at = Some(Utc::now());

        if mode.is_live() {
            if let Err(e) = self.runs.save(&summary).await {
                error!(run_id = %run_id, error = %e, "Failed to persist billing run summary");
                record_error("database", "save_billing_run");
            }
        }

        record_billing_run(mode.as_str(), "completed");
        info!(
            run_id = %run_id,
            checked = summary.checked,
            billed = summary.billed,
            skipped = summary.skipped,
            skipped_not_due = summary.skipped_not_due,
            skipped_already_invoiced = summary.skipped_already_invoiced,
            failed = summary.failed,
            notification_failures = summary.notification_failures,
            idle_reason = summary.idle_reason().unwrap_or(""),
            "Billing run completed"
        );

        Ok(summary)
    }

    async fn record_account_failure(
        &self,
        account: &Account,
        cycle: BillingCycle,
        as_of: DateTime<Utc>,
        err: &AppError,
        summary: &mut BillingRunSummary,
    ) -> Option<String> {
        let metadata = json!({
            "account_id": account.id,
            "period": cycle.period(as_of).as_str(),
            "as_of": as_of.to_rfc3339(),
            "run_id": summary.run_id,
        });
        let entities = vec![AffectedEntity::failed("account", &account.id, err.to_string())];

        match self
            .ledger
            .record_failure(cycle.job_type(), &err.to_string(), metadata, entities)
            .await
        {
            Ok(job) => Some(job.id),
            Err(e) => {
                summary.ledger_errors += 1;
                error!(account_id = %account.id, error = %e, "Failed to record billing failure");
                None
            }
        }
    }

    /// Bill a single account. This is the unit the billing retry handler
    /// re-runs; it never writes to the failed-job ledger.
    #[instrument(skip(self, mode), fields(mode = mode.as_str()))]
    pub async fn bill_account(
        &self,
        account_id: &str,
        as_of: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<AccountOutcome, AppError> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account {} not found", account_id)))?;

        if account.account_status != AccountStatus::Active {
            return Ok(AccountOutcome::Ineligible(format!(
                "account is {}",
                account.account_status
            )));
        }
        let Some((cycle, amount)) = self
            .catalog
            .recurring_fee(account.role(), &account.package_type)
        else {
            return Ok(AccountOutcome::Ineligible(format!(
                "{} on package {} has no recurring billing",
                account.role, account.package_type
            )));
        };

        self.bill(&account, cycle, amount, as_of, mode, None).await
    }

    async fn bill(
        &self,
        account: &Account,
        cycle: BillingCycle,
        amount: i64,
        as_of: DateTime<Utc>,
        mode: RunMode,
        run_id: Option<&str>,
    ) -> Result<AccountOutcome, AppError> {
        let last_invoice = account.last_invoice_date(cycle);
        if !cycle.is_due(last_invoice, as_of) {
            record_account_outcome(cycle.as_str(), "skipped_not_due");
            return Ok(AccountOutcome::Skipped(SkipReason::NotDue));
        }

        let period = cycle.period(as_of);
        let invoice_type = cycle.invoice_type();

        if let Some(existing) = self
            .invoices
            .find_existing(&account.id, invoice_type, period.as_str())
            .await?
        {
            if mode.is_live() && last_invoice < existing.created_at {
                self.repair_billing_dates(account, cycle, existing.created_at)
                    .await;
            }
            record_account_outcome(cycle.as_str(), "skipped_already_invoiced");
            return Ok(AccountOutcome::Skipped(SkipReason::AlreadyInvoiced));
        }

        let invoice = Invoice::new_pending(
            &account.id,
            invoice_type,
            amount,
            &self.currency,
            as_of + cycle.payment_terms(),
            period.into_string(),
            InvoiceMetadata {
                package_type: account.package_type.clone(),
                role: account.role.clone(),
                source: format!("{}_billing", cycle.as_str()),
                run_id: run_id.map(str::to_string),
            },
            as_of,
        );
        let invoice_ref = InvoiceRef {
            invoice_id: invoice.id.clone(),
            account_id: account.id.clone(),
            billing_period: invoice.billing_period.clone(),
            amount,
            planned: !mode.is_live(),
        };

        if !mode.is_live() {
            return Ok(AccountOutcome::Billed {
                invoice: invoice_ref,
                notification_failed: false,
            });
        }

        match self.invoices.create(&invoice).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                info!(account_id = %account.id, billing_period = %invoice.billing_period, "Invoice already created by a concurrent run");
                record_account_outcome(cycle.as_str(), "skipped_already_invoiced");
                return Ok(AccountOutcome::Skipped(SkipReason::AlreadyInvoiced));
            }
            Err(e) => return Err(e),
        }

        // The invoice is committed; the dates are re-derived from it next run
        // if this write is lost.
        self.write_billing_dates(account, cycle, as_of).await;

        record_account_outcome(cycle.as_str(), "billed");
        record_invoice_created(cycle.as_str(), &account.package_type, &self.currency, amount);
        info!(
            account_id = %account.id,
            invoice_id = %invoice.id,
            billing_period = %invoice.billing_period,
            amount = amount,
            "Invoice created"
        );

        let notification_failed = !self.notify_invoice(account, &invoice, cycle).await;

        Ok(AccountOutcome::Billed {
            invoice: invoice_ref,
            notification_failed,
        })
    }

    async fn repair_billing_dates(
        &self,
        account: &Account,
        cycle: BillingCycle,
        invoiced_at: DateTime<Utc>,
    ) {
        if self.write_billing_dates(account, cycle, invoiced_at).await {
            info!(account_id = %account.id, "Re-derived last invoice date from existing invoice");
        }
    }

    /// Best-effort write of the account's billing dates.
    async fn write_billing_dates(
        &self,
        account: &Account,
        cycle: BillingCycle,
        invoiced_at: DateTime<Utc>,
    ) -> bool {
        let update = BillingFieldsUpdate {
            cycle,
            last_invoice_date: invoiced_at,
            next_billing_date: cycle.advance(invoiced_at),
        };
        match self.accounts.update_billing_fields(&account.id, &update).await {
            Ok(()) => true,
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "Failed to write billing dates");
                record_error("database", "update_billing_fields");
                false
            }
        }
    }

    /// Returns false when delivery failed. The invoice stands either way.
    async fn notify_invoice(&self, account: &Account, invoice: &Invoice, cycle: BillingCycle) -> bool {
        let notification = Notification {
            title: "New invoice".to_string(),
            message: format!(
                "Your {} invoice for {} of {} {} is due on {}.",
                cycle.as_str(),
                invoice.billing_period,
                invoice.amount,
                invoice.currency,
                invoice.due_date.format("%Y-%m-%d")
            ),
            severity: Severity::Info,
            action_ref: Some(invoice.id.clone()),
        };

        match self.notifier.notify(account, &notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(account_id = %account.id, invoice_id = %invoice.id, error = %e, "Invoice notification failed");
                record_notification_failure("invoice");
                false
            }
        }
    }
}
