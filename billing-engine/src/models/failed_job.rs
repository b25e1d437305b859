//! Failed-job ledger model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::opt_chrono_datetime_as_bson_datetime;

/// Failed job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedJobStatus {
    Pending,
    Retrying,
    Failed,
    Resolved,
}

impl FailedJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedJobStatus::Pending => "pending",
            FailedJobStatus::Retrying => "retrying",
            FailedJobStatus::Failed => "failed",
            FailedJobStatus::Resolved => "resolved",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FailedJobStatus::Pending),
            "retrying" => Some(FailedJobStatus::Retrying),
            "failed" => Some(FailedJobStatus::Failed),
            "resolved" => Some(FailedJobStatus::Resolved),
            _ => None,
        }
    }

    /// Terminal states are never picked up by the retry worker.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailedJobStatus::Failed | FailedJobStatus::Resolved)
    }
}

/// Outcome of one sub-item of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOutcome {
    Pending,
    Failed,
    Succeeded,
}

impl EntityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityOutcome::Pending => "pending",
            EntityOutcome::Failed => "failed",
            EntityOutcome::Succeeded => "succeeded",
        }
    }
}

/// A sub-item of a job (an account, an invoice, a recipient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedEntity {
    pub entity_id: String,
    pub entity_type: String,
    pub status: EntityOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AffectedEntity {
    pub fn failed(entity_type: &str, entity_id: &str, error: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            status: EntityOutcome::Failed,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.status = EntityOutcome::Succeeded;
        self.error = None;
        self
    }
}

/// Failed job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    #[serde(rename = "_id")]
    pub id: String,
    pub job_type: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub scheduled_time: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: FailedJobStatus,
    pub error_message: String,
    #[serde(default)]
    pub affected_entities: Vec<AffectedEntity>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl FailedJob {
    /// Whether the retry worker should pick this job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            FailedJobStatus::Pending | FailedJobStatus::Retrying
        ) && self.attempt_count < self.max_attempts
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// A `retrying` job whose claim lease has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == FailedJobStatus::Retrying
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// The final attempt was claimed but its worker never reported back.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.lease_expired(now) && self.attempt_count >= self.max_attempts
    }

    /// Metadata string field, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Entities that still need work.
    pub fn unresolved_entities(&self) -> impl Iterator<Item = &AffectedEntity> {
        self.affected_entities
            .iter()
            .filter(|e| e.status != EntityOutcome::Succeeded)
    }
}

/// Filter parameters for listing failed jobs.
#[derive(Debug, Clone, Default)]
pub struct ListFailedJobsFilter {
    pub status: Option<FailedJobStatus>,
    pub job_type: Option<String>,
    pub limit: i64,
}

/// Aggregate result of one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub retried: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub max_attempts_reached: u32,
    pub skipped_unknown: u32,
    pub claim_conflicts: u32,
}
