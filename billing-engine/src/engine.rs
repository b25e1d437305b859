//! Wiring of the billing engine services.

use chrono::Duration;
use std::sync::Arc;

use crate::billing::{BillingCycleProcessor, OverdueSweeper, ReminderService};
use crate::retry::{
    job_types, BackoffPolicy, BillingRetryHandler, BulkNotificationHandler, FailedJobLedger,
    HandlerRegistry, OverdueRetryHandler, ReminderRetryHandler, RetryWorker,
    DEFAULT_MAX_ATTEMPTS,
};
use crate::services::notifier::{NotificationSender, OperatorChannel};
use crate::services::store::{AccountStore, BillingRunStore, FailedJobStore, InvoiceStore};
use crate::services::MemoryStore;

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub accounts: Arc<dyn AccountStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub failed_jobs: Arc<dyn FailedJobStore>,
    pub runs: Arc<dyn BillingRunStore>,
    pub notifier: Arc<dyn NotificationSender>,
    pub operators: Arc<dyn OperatorChannel>,
}

impl EngineDeps {
    /// All four stores backed by one in-memory store.
    pub fn in_memory(
        store: Arc<MemoryStore>,
        notifier: Arc<dyn NotificationSender>,
        operators: Arc<dyn OperatorChannel>,
    ) -> Self {
        Self {
            accounts: store.clone(),
            invoices: store.clone(),
            failed_jobs: store.clone(),
            runs: store,
            notifier,
            operators,
        }
    }
}

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub currency: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retry_batch_size: i64,
    pub claim_lease: Duration,
    pub reminder_window: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            currency: "IDR".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            retry_batch_size: 100,
            claim_lease: Duration::minutes(15),
            reminder_window: Duration::days(3),
        }
    }
}

/// The assembled engine. Cheap to clone.
#[derive(Clone)]
pub struct BillingEngine {
    pub processor: Arc<BillingCycleProcessor>,
    pub ledger: Arc<FailedJobLedger>,
    pub worker: Arc<RetryWorker>,
    pub reminders: Arc<ReminderService>,
    pub overdue: Arc<OverdueSweeper>,
    pub runs: Arc<dyn BillingRunStore>,
}

impl BillingEngine {
    /// Build the engine with the built-in retry handlers registered.
    pub fn new(deps: EngineDeps, settings: &EngineSettings) -> Self {
        Self::with_registry(deps, settings, HandlerRegistry::new())
    }

    /// Build the engine, adding the built-in handlers to `registry`. Handlers
    /// already present in `registry` for a built-in job type are kept.
    pub fn with_registry(
        deps: EngineDeps,
        settings: &EngineSettings,
        mut registry: HandlerRegistry,
    ) -> Self {
        let ledger = Arc::new(FailedJobLedger::new(
            deps.failed_jobs.clone(),
            deps.operators.clone(),
            settings.backoff,
            settings.max_attempts,
        ));

        let processor = Arc::new(BillingCycleProcessor::new(
            deps.accounts.clone(),
            deps.invoices.clone(),
            deps.runs.clone(),
            deps.notifier.clone(),
            ledger.clone(),
            &settings.currency,
        ));

        let reminders = Arc::new(ReminderService::new(
            deps.accounts.clone(),
            deps.invoices.clone(),
            deps.notifier.clone(),
            ledger.clone(),
            settings.reminder_window,
        ));

        let overdue = Arc::new(OverdueSweeper::new(
            deps.accounts.clone(),
            deps.invoices.clone(),
            ledger.clone(),
        ));

        let billing_handler = Arc::new(BillingRetryHandler::new(processor.clone()));
        if !registry.contains(job_types::MONTHLY_BILLING) {
            registry.register(job_types::MONTHLY_BILLING, billing_handler.clone());
        }
        if !registry.contains(job_types::ANNUAL_BILLING) {
            registry.register(job_types::ANNUAL_BILLING, billing_handler);
        }
        if !registry.contains(job_types::PAYMENT_REMINDER) {
            registry.register(
                job_types::PAYMENT_REMINDER,
                Arc::new(ReminderRetryHandler::new(reminders.clone())),
            );
        }
        if !registry.contains(job_types::OVERDUE_SWEEP) {
            registry.register(
                job_types::OVERDUE_SWEEP,
                Arc::new(OverdueRetryHandler::new(overdue.clone())),
            );
        }
        if !registry.contains(job_types::BULK_NOTIFICATION) {
            registry.register(
                job_types::BULK_NOTIFICATION,
                Arc::new(BulkNotificationHandler::new(
                    deps.accounts.clone(),
                    deps.notifier.clone(),
                )),
            );
        }

        let worker = Arc::new(RetryWorker::new(
            ledger.clone(),
            Arc::new(registry),
            settings.retry_batch_size,
            settings.claim_lease,
        ));

        Self {
            processor,
            ledger,
            worker,
            reminders,
            overdue,
            runs: deps.runs,
        }
    }
}
