//! In-memory store for local dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::store::{
    AccountStore, BillingRunStore, BillingSelection, ClaimExpectation, FailedJobStore,
    InvoiceStore, JobTypeFilter,
};
use crate::models::{
    Account, AccountStatus, BillingFieldsUpdate, BillingRunSummary, FailedJob, FailedJobStatus,
    Invoice, InvoiceStatus, InvoiceType, ListFailedJobsFilter, PaymentStatus,
};
use crate::billing::BillingCycle;

#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, Account>>,
    invoices: Mutex<Vec<Invoice>>,
    failed_jobs: Mutex<HashMap<String, FailedJob>>,
    billing_runs: Mutex<HashMap<String, BillingRunSummary>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>, AppError> {
    mutex
        .lock()
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("{} mutex poisoned: {}", name, e)))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace an account.
    pub fn put_account(&self, account: Account) -> Result<(), AppError> {
        lock(&self.accounts, "accounts")?.insert(account.id.clone(), account);
        Ok(())
    }

    pub fn accounts(&self) -> Result<Vec<Account>, AppError> {
        Ok(lock(&self.accounts, "accounts")?.values().cloned().collect())
    }

    pub fn invoices(&self) -> Result<Vec<Invoice>, AppError> {
        Ok(lock(&self.invoices, "invoices")?.clone())
    }

    /// Overwrite an invoice, e.g. to record a payment in tests.
    pub fn put_invoice(&self, invoice: Invoice) -> Result<(), AppError> {
        let mut invoices = lock(&self.invoices, "invoices")?;
        invoices.retain(|i| i.id != invoice.id);
        invoices.push(invoice);
        Ok(())
    }

    pub fn failed_jobs(&self) -> Result<Vec<FailedJob>, AppError> {
        let mut jobs: Vec<FailedJob> = lock(&self.failed_jobs, "failed_jobs")?
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

fn sort_by_schedule(jobs: &mut [FailedJob]) {
    jobs.sort_by(|a, b| {
        a.scheduled_time
            .cmp(&b.scheduled_time)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn find_due_for_billing(
        &self,
        criteria: &BillingSelection,
    ) -> Result<Vec<Account>, AppError> {
        let mut accounts: Vec<Account> = lock(&self.accounts, "accounts")?
            .values()
            .filter(|a| criteria.matches(a))
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(accounts)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, AppError> {
        Ok(lock(&self.accounts, "accounts")?.get(id).cloned())
    }

    async fn update_billing_fields(
        &self,
        id: &str,
        fields: &BillingFieldsUpdate,
    ) -> Result<(), AppError> {
        let mut accounts = lock(&self.accounts, "accounts")?;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account {} not found", id)))?;
        match fields.cycle {
            BillingCycle::Monthly => account.last_monthly_invoice_date = Some(fields.last_invoice_date),
            BillingCycle::Annual => account.last_annual_invoice_date = Some(fields.last_invoice_date),
        }
        account.next_billing_date = Some(fields.next_billing_date);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        account_status: AccountStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), AppError> {
        let mut accounts = lock(&self.accounts, "accounts")?;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account {} not found", id)))?;
        account.account_status = account_status;
        account.payment_status = payment_status;
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn find_existing(
        &self,
        account_id: &str,
        invoice_type: InvoiceType,
        billing_period: &str,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(lock(&self.invoices, "invoices")?
            .iter()
            .find(|i| {
                i.account_id == account_id
                    && i.invoice_type == invoice_type
                    && i.billing_period == billing_period
            })
            .cloned())
    }

    async fn create(&self, invoice: &Invoice) -> Result<(), AppError> {
        let mut invoices = lock(&self.invoices, "invoices")?;
        let duplicate = invoices.iter().any(|i| {
            i.account_id == invoice.account_id
                && i.invoice_type == invoice.invoice_type
                && i.billing_period == invoice.billing_period
        });
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice for account {} period {} already exists",
                invoice.account_id,
                invoice.billing_period
            )));
        }
        invoices.push(invoice.clone());
        Ok(())
    }

    async fn find_pending(&self, due_before: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let mut pending: Vec<Invoice> = lock(&self.invoices, "invoices")?
            .iter()
            .filter(|i| i.status == InvoiceStatus::Pending && i.due_date < due_before)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.due_date.cmp(&b.due_date));
        Ok(pending)
    }

    async fn mark_overdue(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut invoices = lock(&self.invoices, "invoices")?;
        match invoices
            .iter_mut()
            .find(|i| i.id == id && i.status == InvoiceStatus::Pending)
        {
            Some(invoice) => {
                invoice.status = InvoiceStatus::Overdue;
                invoice.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Invoice>, AppError> {
        Ok(lock(&self.invoices, "invoices")?
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }
}

#[async_trait]
impl FailedJobStore for MemoryStore {
    async fn insert(&self, job: &FailedJob) -> Result<(), AppError> {
        let mut jobs = lock(&self.failed_jobs, "failed_jobs")?;
        if jobs.contains_key(&job.id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Failed job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        job_types: JobTypeFilter<'_>,
        limit: i64,
    ) -> Result<Vec<FailedJob>, AppError> {
        let mut due: Vec<FailedJob> = lock(&self.failed_jobs, "failed_jobs")?
            .values()
            .filter(|j| j.is_due(now) && job_types.matches(&j.job_type))
            .cloned()
            .collect();
        sort_by_schedule(&mut due);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn find_expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FailedJob>, AppError> {
        let mut expired: Vec<FailedJob> = lock(&self.failed_jobs, "failed_jobs")?
            .values()
            .filter(|j| j.is_abandoned(now))
            .cloned()
            .collect();
        sort_by_schedule(&mut expired);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn claim(
        &self,
        id: &str,
        expected: ClaimExpectation,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<FailedJob>, AppError> {
        let mut jobs = lock(&self.failed_jobs, "failed_jobs")?;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if job.status != expected.status || job.attempt_count != expected.attempt_count {
            return Ok(None);
        }
        job.status = FailedJobStatus::Retrying;
        job.attempt_count += 1;
        job.last_attempt_at = Some(now);
        job.next_retry_at = Some(lease_until);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update(
        &self,
        job: &FailedJob,
        expected: ClaimExpectation,
    ) -> Result<bool, AppError> {
        let mut jobs = lock(&self.failed_jobs, "failed_jobs")?;
        let Some(stored) = jobs.get_mut(&job.id) else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Failed job {} not found",
                job.id
            )));
        };
        if stored.status != expected.status || stored.attempt_count != expected.attempt_count {
            return Ok(false);
        }
        *stored = job.clone();
        Ok(true)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FailedJob>, AppError> {
        Ok(lock(&self.failed_jobs, "failed_jobs")?.get(id).cloned())
    }

    async fn list(&self, filter: &ListFailedJobsFilter) -> Result<Vec<FailedJob>, AppError> {
        let mut jobs: Vec<FailedJob> = lock(&self.failed_jobs, "failed_jobs")?
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| filter.job_type.as_deref().is_none_or(|t| j.job_type == t))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            jobs.truncate(filter.limit as usize);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl BillingRunStore for MemoryStore {
    async fn save(&self, summary: &BillingRunSummary) -> Result<(), AppError> {
        lock(&self.billing_runs, "billing_runs")?.insert(summary.run_id.clone(), summary.clone());
        Ok(())
    }

    async fn find_by_id(&self, run_id: &str) -> Result<Option<BillingRunSummary>, AppError> {
        Ok(lock(&self.billing_runs, "billing_runs")?.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceMetadata;
    use chrono::Duration;

    fn invoice(account_id: &str, period: &str) -> Invoice {
        let now = Utc::now();
        Invoice::new_pending(
            account_id,
            InvoiceType::Subscription,
            20_000,
            "IDR",
            now + Duration::days(7),
            period.to_string(),
            InvoiceMetadata {
                package_type: "basic".to_string(),
                role: "student".to_string(),
                source: "test".to_string(),
                run_id: None,
            },
            now,
        )
    }

    #[tokio::test]
    async fn test_duplicate_invoice_conflicts() {
        let store = MemoryStore::new();
        store.create(&invoice("acc-1", "2024-03")).await.unwrap();
        let err = store.create(&invoice("acc-1", "2024-03")).await.unwrap_err();
        assert!(err.is_conflict());
        store.create(&invoice("acc-1", "2024-04")).await.unwrap();
        assert_eq!(store.invoices().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_overdue_only_pending() {
        let store = MemoryStore::new();
        let inv = invoice("acc-1", "2024-03");
        store.create(&inv).await.unwrap();
        assert!(store.mark_overdue(&inv.id, Utc::now()).await.unwrap());
        assert!(!store.mark_overdue(&inv.id, Utc::now()).await.unwrap());
    }
}
