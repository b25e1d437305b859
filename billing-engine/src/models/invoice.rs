//! Invoice model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invoice type. Recurring invoices are `Subscription` (monthly) or
/// `Membership` (annual); `Fee` covers one-time charges issued elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Membership,
    Subscription,
    Fee,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Membership => "membership",
            InvoiceType::Subscription => "subscription",
            InvoiceType::Fee => "fee",
        }
    }
}

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

/// Generation context stored with each invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceMetadata {
    pub package_type: String,
    pub role: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Invoice. Unique per (account_id, invoice_type, billing_period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: String,
    pub account_id: String,
    pub invoice_type: InvoiceType,
    pub amount: i64,
    #[serde(default)]
    pub amount_paid: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub due_date: DateTime<Utc>,
    pub billing_period: String,
    pub metadata: InvoiceMetadata,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Build a new pending invoice issued at `issued_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        account_id: &str,
        invoice_type: InvoiceType,
        amount: i64,
        currency: &str,
        due_date: DateTime<Utc>,
        billing_period: String,
        metadata: InvoiceMetadata,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            invoice_type,
            amount,
            amount_paid: 0,
            currency: currency.to_string(),
            status: InvoiceStatus::Pending,
            due_date,
            billing_period,
            metadata,
            created_at: issued_at,
            updated_at: issued_at,
        }
    }

    /// Amount still owed.
    pub fn outstanding(&self) -> i64 {
        (self.amount - self.amount_paid).max(0)
    }
}
