//! Recurring billing: pricing, status classification and the cycle
//! processor.

pub mod overdue;
pub mod period;
pub mod pricing;
pub mod processor;
pub mod reminders;
pub mod status;

pub use overdue::{InvoiceSweep, OverdueSummary, OverdueSweeper};
pub use period::{BillingCycle, BillingPeriod};
pub use pricing::{PackageType, PricingCatalog};
pub use processor::{AccountOutcome, BillingCycleProcessor};
pub use reminders::{ReminderResult, ReminderService, ReminderSummary};
pub use status::{
    classify, is_valid_transition, plan_transition, validate_transition, Classification,
    StatusError, StatusUpdate,
};
