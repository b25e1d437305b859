//! Billing run model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::opt_chrono_datetime_as_bson_datetime;

/// Billing run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Live,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::DryRun => "dry_run",
            RunMode::Live => "live",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, RunMode::Live)
    }
}

/// Why an account was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotDue,
    AlreadyInvoiced,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotDue => "not_due",
            SkipReason::AlreadyInvoiced => "already_invoiced",
        }
    }
}

/// Per-package or per-role counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBreakdown {
    pub checked: u32,
    pub billed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub amount_billed: i64,
}

/// Reference to an invoice created (or planned, in a dry run) by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRef {
    pub invoice_id: String,
    pub account_id: String,
    pub billing_period: String,
    pub amount: i64,
    pub planned: bool,
}

/// A per-account failure inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountFailure {
    pub account_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_job_id: Option<String>,
}

/// Full breakdown of a billing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRunSummary {
    #[serde(rename = "_id")]
    pub run_id: String,
    pub mode: RunMode,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub as_of: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    pub checked: u32,
    pub billed: u32,
    pub skipped: u32,
    pub skipped_not_due: u32,
    pub skipped_already_invoiced: u32,
    pub failed: u32,
    pub notification_failures: u32,
    pub ledger_errors: u32,
    pub by_package: BTreeMap<String, RunBreakdown>,
    pub by_role: BTreeMap<String, RunBreakdown>,
    pub invoices: Vec<InvoiceRef>,
    pub failures: Vec<AccountFailure>,
}

impl BillingRunSummary {
    pub fn new(run_id: String, mode: RunMode, as_of: DateTime<Utc>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mode,
            as_of,
            started_at,
            completed_at: None,
            checked: 0,
            billed: 0,
            skipped: 0,
            skipped_not_due: 0,
            skipped_already_invoiced: 0,
            failed: 0,
            notification_failures: 0,
            ledger_errors: 0,
            by_package: BTreeMap::new(),
            by_role: BTreeMap::new(),
            invoices: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn breakdowns(&mut self, package: &str, role: &str) -> [&mut RunBreakdown; 2] {
        let package = self.by_package.entry(package.to_string()).or_default();
        let role = self.by_role.entry(role.to_string()).or_default();
        [package, role]
    }

    pub fn record_checked(&mut self, package: &str, role: &str) {
        self.checked += 1;
        for b in self.breakdowns(package, role) {
            b.checked += 1;
        }
    }

    pub fn record_billed(&mut self, package: &str, role: &str, invoice: InvoiceRef) {
        self.billed += 1;
        for b in self.breakdowns(package, role) {
            b.billed += 1;
            b.amount_billed += invoice.amount;
        }
        self.invoices.push(invoice);
    }

    pub fn record_skipped(&mut self, package: &str, role: &str, reason: SkipReason) {
        self.skipped += 1;
        match reason {
            SkipReason::NotDue => self.skipped_not_due += 1,
            SkipReason::AlreadyInvoiced => self.skipped_already_invoiced += 1,
        }
        for b in self.breakdowns(package, role) {
            b.skipped += 1;
        }
    }

    pub fn record_failed(&mut self, package: &str, role: &str, failure: AccountFailure) {
        self.failed += 1;
        for b in self.breakdowns(package, role) {
            b.failed += 1;
        }
        self.failures.push(failure);
    }

    /// Human-readable reason for a run that billed nothing.
    pub fn idle_reason(&self) -> Option<&'static str> {
        if self.billed > 0 {
            return None;
        }
        Some(if self.checked == 0 {
            "no eligible accounts"
        } else if self.failed == self.checked {
            "all eligible accounts failed"
        } else if self.skipped_already_invoiced > 0 && self.skipped_not_due == 0 {
            "all due accounts already invoiced"
        } else {
            "no accounts due"
        })
    }
}
