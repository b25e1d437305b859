//! Account model.
//!
//! Accounts are owned by the account-management subsystem. The engine reads
//! the identity and package fields and writes only status and billing dates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::opt_chrono_datetime_as_bson_datetime;
use crate::billing::BillingCycle;

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Entrepreneur,
    NonStudent,
    Teacher,
    Admin,
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Entrepreneur => "entrepreneur",
            Role::NonStudent => "nonstudent",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
            Role::Other => "other",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Role::Student,
            "entrepreneur" => Role::Entrepreneur,
            "nonstudent" | "non_student" | "non-student" => Role::NonStudent,
            "teacher" => Role::Teacher,
            "admin" => Role::Admin,
            _ => Role::Other,
        }
    }

    /// Roles that pay registration and recurring fees.
    pub fn requires_payment(&self) -> bool {
        matches!(self, Role::Student | Role::Entrepreneur | Role::NonStudent)
    }

    /// The payment-required roles, as stored.
    pub fn payment_required() -> [Role; 3] {
        [Role::Student, Role::Entrepreneur, Role::NonStudent]
    }
}

/// Institution type, used by registration pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstitutionType {
    Government,
    Private,
}

impl InstitutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstitutionType::Government => "government",
            InstitutionType::Private => "private",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => InstitutionType::Private,
            _ => InstitutionType::Government,
        }
    }
}

/// Platform access status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    #[default]
    Inactive,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    PartialPaid,
    #[default]
    NoPayment,
    Overdue,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::PartialPaid => "partial_paid",
            PaymentStatus::NoPayment => "no_payment",
            PaymentStatus::Overdue => "overdue",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account as read by the billing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: String,
    pub package_type: String,
    #[serde(default)]
    pub institution_type: String,
    #[serde(default)]
    pub account_status: AccountStatus,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub last_monthly_invoice_date: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub last_annual_invoice_date: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub next_billing_date: Option<DateTime<Utc>>,
}

impl Account {
    pub fn role(&self) -> Role {
        Role::from_string(&self.role)
    }

    pub fn institution(&self) -> InstitutionType {
        InstitutionType::from_string(&self.institution_type)
    }

    /// Last invoice date for the cycle, falling back to account creation.
    pub fn last_invoice_date(&self, cycle: BillingCycle) -> DateTime<Utc> {
        let last = match cycle {
            BillingCycle::Monthly => self.last_monthly_invoice_date,
            BillingCycle::Annual => self.last_annual_invoice_date,
        };
        last.unwrap_or(self.created_at)
    }
}

/// Billing-date fields written after an invoice is issued.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingFieldsUpdate {
    pub cycle: BillingCycle,
    pub last_invoice_date: DateTime<Utc>,
    pub next_billing_date: DateTime<Utc>,
}

impl BillingFieldsUpdate {
    /// Name of the last-invoice field for this cycle.
    pub fn last_invoice_field(&self) -> &'static str {
        match self.cycle {
            BillingCycle::Monthly => "last_monthly_invoice_date",
            BillingCycle::Annual => "last_annual_invoice_date",
        }
    }
}
