//! Services module for billing-engine.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod store;

pub use database::MongoDb;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics, record_grpc_request, record_grpc_request_duration};
pub use notifier::{
    HttpNotificationSender, HttpOperatorChannel, LogNotificationSender, LogOperatorChannel,
    Notification, NotificationSender, NotifyError, OperatorAlert, OperatorChannel, Severity,
};
pub use store::{
    AccountStore, BillingRunStore, BillingSelection, ClaimExpectation, FailedJobStore,
    InvoiceStore, JobTypeFilter,
};
