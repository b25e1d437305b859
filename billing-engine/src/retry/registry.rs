//! Retry handlers and backoff policy.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{AffectedEntity, FailedJob};

/// What a handler reports after re-running a job.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub succeeded: bool,
    /// Resolution note on success, error message on failure.
    pub message: String,
    /// Replacement entity list, when the handler tracks sub-items.
    pub affected_entities: Option<Vec<AffectedEntity>>,
}

impl RetryOutcome {
    pub fn success(resolution: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: resolution.into(),
            affected_entities: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: error.into(),
            affected_entities: None,
        }
    }

    pub fn with_entities(mut self, entities: Vec<AffectedEntity>) -> Self {
        self.affected_entities = Some(entities);
        self
    }
}

/// Re-executes one category of failed job.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, job: &FailedJob, now: DateTime<Utc>) -> Result<RetryOutcome, AppError>;
}

/// Job type to handler map, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RetryHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `job_type`.
    pub fn register(&mut self, job_type: &str, handler: Arc<dyn RetryHandler>) -> &mut Self {
        self.handlers.insert(job_type.to_string(), handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn RetryHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::minutes(30),
            factor: 2,
            max_delay: Duration::hours(24),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the first retry of a newly recorded job.
    pub fn initial_delay(&self) -> Duration {
        self.base_delay.min(self.max_delay)
    }

    /// Delay after a failed attempt, `base * factor^(attempt_count - 1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        let multiplier = (self.factor.max(1) as i64)
            .checked_pow(exponent)
            .unwrap_or(i64::MAX);
        let base_secs = self.base_delay.num_seconds();
        let delay_secs = base_secs
            .saturating_mul(multiplier)
            .min(self.max_delay.num_seconds());
        Duration::seconds(delay_secs)
    }
}
