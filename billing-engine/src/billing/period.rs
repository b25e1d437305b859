//! Billing cycles and period keys.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::models::InvoiceType;

/// Minimum account age before the first recurring invoice, and the length of
/// a monthly cycle.
pub const MONTHLY_CYCLE_DAYS: i64 = 30;

/// Month (1-based) in which the academic year starts.
pub const ACADEMIC_YEAR_START_MONTH: u32 = 7;

/// Recurring billing cycle of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }

    /// Invoice type issued for this cycle.
    pub fn invoice_type(&self) -> InvoiceType {
        match self {
            BillingCycle::Monthly => InvoiceType::Subscription,
            BillingCycle::Annual => InvoiceType::Membership,
        }
    }

    /// Failed-job type used when billing this cycle fails.
    pub fn job_type(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => crate::retry::job_types::MONTHLY_BILLING,
            BillingCycle::Annual => crate::retry::job_types::ANNUAL_BILLING,
        }
    }

    /// Start of the next cycle after `from`.
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BillingCycle::Monthly => from + Duration::days(MONTHLY_CYCLE_DAYS),
            BillingCycle::Annual => from
                .checked_add_months(Months::new(12))
                .unwrap_or(from + Duration::days(365)),
        }
    }

    /// Whether a full cycle has elapsed between `last_invoice` and `as_of`.
    pub fn is_due(&self, last_invoice: DateTime<Utc>, as_of: DateTime<Utc>) -> bool {
        as_of >= self.advance(last_invoice)
    }

    /// Payment window granted on a new invoice.
    pub fn payment_terms(&self) -> Duration {
        match self {
            BillingCycle::Monthly => Duration::days(7),
            BillingCycle::Annual => Duration::days(30),
        }
    }

    /// Period key of the invoice issued at `as_of`.
    pub fn period(&self, as_of: DateTime<Utc>) -> BillingPeriod {
        match self {
            BillingCycle::Monthly => BillingPeriod::month(as_of),
            BillingCycle::Annual => BillingPeriod::academic_year(as_of),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing period key, `YYYY-MM` or `AYyyyy-yyyy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BillingPeriod(String);

impl BillingPeriod {
    pub fn month(at: DateTime<Utc>) -> Self {
        Self(format!("{:04}-{:02}", at.year(), at.month()))
    }

    pub fn academic_year(at: DateTime<Utc>) -> Self {
        let start = if at.month() >= ACADEMIC_YEAR_START_MONTH {
            at.year()
        } else {
            at.year() - 1
        };
        Self(format!("AY{}-{}", start, start + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_month_key() {
        assert_eq!(BillingPeriod::month(at(2024, 3, 9)).as_str(), "2024-03");
        assert_eq!(BillingPeriod::month(at(2024, 12, 31)).as_str(), "2024-12");
    }

    #[test]
    fn test_academic_year_key() {
        assert_eq!(
            BillingPeriod::academic_year(at(2024, 7, 1)).as_str(),
            "AY2024-2025"
        );
        assert_eq!(
            BillingPeriod::academic_year(at(2025, 6, 30)).as_str(),
            "AY2024-2025"
        );
        assert_eq!(
            BillingPeriod::academic_year(at(2025, 1, 15)).as_str(),
            "AY2024-2025"
        );
    }

    #[test]
    fn test_monthly_due_after_thirty_days() {
        let last = at(2024, 1, 1);
        assert!(!BillingCycle::Monthly.is_due(last, at(2024, 1, 30)));
        assert!(BillingCycle::Monthly.is_due(last, at(2024, 1, 31)));
    }

    #[test]
    fn test_annual_due_after_twelve_months() {
        let last = at(2023, 9, 1);
        assert!(!BillingCycle::Annual.is_due(last, at(2024, 8, 31)));
        assert!(BillingCycle::Annual.is_due(last, at(2024, 9, 1)));
    }

    #[test]
    fn test_cycle_invoice_types_and_terms() {
        assert_eq!(BillingCycle::Monthly.invoice_type(), InvoiceType::Subscription);
        assert_eq!(BillingCycle::Annual.invoice_type(), InvoiceType::Membership);
        assert_eq!(BillingCycle::Monthly.payment_terms(), Duration::days(7));
        assert_eq!(BillingCycle::Annual.payment_terms(), Duration::days(30));
    }
}
