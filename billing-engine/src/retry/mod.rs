//! Failed-job ledger and retry worker.

pub mod handlers;
pub mod ledger;
pub mod registry;
pub mod worker;

pub use handlers::{
    BillingRetryHandler, BulkNotificationHandler, OverdueRetryHandler, ReminderRetryHandler,
};
pub use ledger::{FailedJobLedger, DEFAULT_MAX_ATTEMPTS};
pub use registry::{BackoffPolicy, HandlerRegistry, RetryHandler, RetryOutcome};
pub use worker::RetryWorker;

/// Built-in job types.
pub mod job_types {
    pub const MONTHLY_BILLING: &str = "monthly_billing";
    pub const ANNUAL_BILLING: &str = "annual_billing";
    pub const PAYMENT_REMINDER: &str = "payment_reminder";
    pub const BULK_NOTIFICATION: &str = "bulk_notification";
    pub const OVERDUE_SWEEP: &str = "overdue_sweep";
}
