//! Storage seams used by the billing engine.
//!
//! Implemented by [`super::database::MongoDb`] for production and by
//! [`super::memory::MemoryStore`] for local dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

use crate::models::{
    Account, AccountStatus, BillingFieldsUpdate, BillingRunSummary, FailedJob, FailedJobStatus,
    Invoice, InvoiceType, ListFailedJobsFilter, PaymentStatus,
};

/// Account selection criteria for a billing run.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingSelection {
    pub roles: Vec<String>,
    pub package_types: Vec<String>,
    /// Only accounts created at or before this instant.
    pub created_before: DateTime<Utc>,
}

impl BillingSelection {
    pub fn matches(&self, account: &Account) -> bool {
        account.account_status == AccountStatus::Active
            && self.roles.iter().any(|r| *r == account.role)
            && self.package_types.iter().any(|p| *p == account.package_type)
            && account.created_at <= self.created_before
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_due_for_billing(
        &self,
        criteria: &BillingSelection,
    ) -> Result<Vec<Account>, AppError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, AppError>;

    async fn update_billing_fields(
        &self,
        id: &str,
        fields: &BillingFieldsUpdate,
    ) -> Result<(), AppError>;

    async fn update_status(
        &self,
        id: &str,
        account_status: AccountStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn find_existing(
        &self,
        account_id: &str,
        invoice_type: InvoiceType,
        billing_period: &str,
    ) -> Result<Option<Invoice>, AppError>;

    /// Insert an invoice. A duplicate (account, type, period) yields
    /// `AppError::Conflict`.
    async fn create(&self, invoice: &Invoice) -> Result<(), AppError>;

    /// Pending invoices due strictly before `due_before`.
    async fn find_pending(&self, due_before: DateTime<Utc>) -> Result<Vec<Invoice>, AppError>;

    /// Move a pending invoice to overdue. Returns false if it was no longer
    /// pending.
    async fn mark_overdue(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Invoice>, AppError>;
}

/// Restricts a due-job query by job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTypeFilter<'a> {
    /// Only jobs of these types.
    Only(&'a [String]),
    /// Every job whose type is not listed.
    Except(&'a [String]),
}

impl JobTypeFilter<'_> {
    pub fn matches(&self, job_type: &str) -> bool {
        match self {
            JobTypeFilter::Only(types) => types.iter().any(|t| t == job_type),
            JobTypeFilter::Except(types) => !types.iter().any(|t| t == job_type),
        }
    }
}

/// Expected state for a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimExpectation {
    pub status: FailedJobStatus,
    pub attempt_count: u32,
}

#[async_trait]
pub trait FailedJobStore: Send + Sync {
    async fn insert(&self, job: &FailedJob) -> Result<(), AppError>;

    /// Due jobs matching `job_types`, ordered by scheduled time, then
    /// creation time.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        job_types: JobTypeFilter<'_>,
        limit: i64,
    ) -> Result<Vec<FailedJob>, AppError>;

    /// Jobs still `retrying` on their last attempt whose lease ran out, i.e.
    /// the worker that claimed them never wrote an outcome.
    async fn find_expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FailedJob>, AppError>;

    /// Atomically move a job to `retrying` if it still matches `expected`.
    /// Increments the attempt count, stamps `last_attempt_at = now` and
    /// sets `next_retry_at = lease_until`. Returns the claimed job, or
    /// `None` if another worker got there first.
    async fn claim(
        &self,
        id: &str,
        expected: ClaimExpectation,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<FailedJob>, AppError>;

    /// Replace the stored job if it still matches `expected`. Returns false
    /// when another writer changed it first.
    async fn update(
        &self,
        job: &FailedJob,
        expected: ClaimExpectation,
    ) -> Result<bool, AppError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<FailedJob>, AppError>;

    async fn list(&self, filter: &ListFailedJobsFilter) -> Result<Vec<FailedJob>, AppError>;
}

#[async_trait]
pub trait BillingRunStore: Send + Sync {
    async fn save(&self, summary: &BillingRunSummary) -> Result<(), AppError>;

    async fn find_by_id(&self, run_id: &str) -> Result<Option<BillingRunSummary>, AppError>;
}
