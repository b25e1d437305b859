//! Domain models for billing-engine.

mod account;
mod billing_run;
mod failed_job;
mod invoice;

pub use account::{
    Account, AccountStatus, BillingFieldsUpdate, InstitutionType, PaymentStatus, Role,
};
pub use billing_run::{
    AccountFailure, BillingRunSummary, InvoiceRef, RunBreakdown, RunMode, SkipReason,
};
pub use failed_job::{
    AffectedEntity, EntityOutcome, FailedJob, FailedJobStatus, ListFailedJobsFilter,
    RetrySummary,
};
pub use invoice::{Invoice, InvoiceMetadata, InvoiceStatus, InvoiceType};

// Helper module for optional DateTime<Utc> as BSON DateTime
pub(crate) mod opt_chrono_datetime_as_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt.map(|dt| dt.to_chrono()))
    }
}
