//! Configuration for billing-engine.

use chrono::Duration;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, parse_env};
use service_core::error::AppError;
use std::env;

use crate::engine::EngineSettings;
use crate::retry::BackoffPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct BillingEngineConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageConfig,
    pub billing: BillingSettings,
    pub notifications: NotificationConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongodb,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(StorageBackend::Mongodb),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub mongodb: Option<MongoConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingSettings {
    pub currency: String,
    pub max_attempts: u32,
    pub retry_base_delay_minutes: i64,
    pub retry_max_delay_minutes: i64,
    pub retry_batch_size: i64,
    pub claim_lease_minutes: i64,
    pub reminder_window_days: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            currency: "IDR".to_string(),
            max_attempts: 3,
            retry_base_delay_minutes: 30,
            retry_max_delay_minutes: 24 * 60,
            retry_batch_size: 100,
            claim_lease_minutes: 15,
            reminder_window_days: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Account notification endpoint. Log-only when unset.
    pub notify_url: Option<String>,
    /// Operator alert webhook. Log-only when unset.
    pub operator_webhook_url: Option<String>,
    pub timeout_secs: u64,
    pub operator_retry_max_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notify_url: None,
            operator_webhook_url: None,
            timeout_secs: 10,
            operator_retry_max_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub billing_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub reminder_interval_secs: u64,
    pub overdue_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            billing_interval_secs: 24 * 60 * 60,
            retry_interval_secs: 15 * 60,
            reminder_interval_secs: 24 * 60 * 60,
            overdue_interval_secs: 60 * 60,
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl BillingEngineConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common = core_config::Config::load()?;
        let is_prod = common.is_prod();

        let backend: StorageBackend = get_env("STORAGE_BACKEND", Some("memory"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let mongodb = match backend {
            StorageBackend::Mongodb => Some(MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("billing_db"), is_prod)?,
            }),
            StorageBackend::Memory => {
                if is_prod {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "The memory storage backend is not allowed in production"
                    )));
                }
                None
            }
        };

        let defaults = BillingSettings::default();
        let billing = BillingSettings {
            currency: get_env("BILLING_CURRENCY", Some(&defaults.currency), is_prod)?,
            max_attempts: parse_env("FAILED_JOB_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base_delay_minutes: parse_env(
                "RETRY_BASE_DELAY_MINUTES",
                defaults.retry_base_delay_minutes,
            )?,
            retry_max_delay_minutes: parse_env(
                "RETRY_MAX_DELAY_MINUTES",
                defaults.retry_max_delay_minutes,
            )?,
            retry_batch_size: parse_env("RETRY_BATCH_SIZE", defaults.retry_batch_size)?,
            claim_lease_minutes: parse_env("RETRY_CLAIM_LEASE_MINUTES", defaults.claim_lease_minutes)?,
            reminder_window_days: parse_env("REMINDER_WINDOW_DAYS", defaults.reminder_window_days)?,
        };

        let notification_defaults = NotificationConfig::default();
        let notifications = NotificationConfig {
            notify_url: optional_env("NOTIFICATION_URL"),
            operator_webhook_url: optional_env("OPERATOR_WEBHOOK_URL"),
            timeout_secs: parse_env("NOTIFICATION_TIMEOUT_SECS", notification_defaults.timeout_secs)?,
            operator_retry_max_secs: parse_env(
                "OPERATOR_RETRY_MAX_SECS",
                notification_defaults.operator_retry_max_secs,
            )?,
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: parse_env("SCHEDULER_ENABLED", scheduler_defaults.enabled)?,
            billing_interval_secs: parse_env(
                "SCHEDULER_BILLING_INTERVAL_SECS",
                scheduler_defaults.billing_interval_secs,
            )?,
            retry_interval_secs: parse_env(
                "SCHEDULER_RETRY_INTERVAL_SECS",
                scheduler_defaults.retry_interval_secs,
            )?,
            reminder_interval_secs: parse_env(
                "SCHEDULER_REMINDER_INTERVAL_SECS",
                scheduler_defaults.reminder_interval_secs,
            )?,
            overdue_interval_secs: parse_env(
                "SCHEDULER_OVERDUE_INTERVAL_SECS",
                scheduler_defaults.overdue_interval_secs,
            )?,
        };

        let config = BillingEngineConfig {
            service_name: get_env("SERVICE_NAME", Some("billing-engine"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: optional_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
            common,
            storage: StorageConfig { backend, mongodb },
            billing,
            notifications,
            scheduler,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let b = &self.billing;
        if b.max_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FAILED_JOB_MAX_ATTEMPTS must be at least 1"
            )));
        }
        if b.retry_base_delay_minutes <= 0 || b.retry_max_delay_minutes < b.retry_base_delay_minutes
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Retry delays must be positive and the maximum must not be below the base"
            )));
        }
        if b.retry_batch_size <= 0 || b.claim_lease_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RETRY_BATCH_SIZE and RETRY_CLAIM_LEASE_MINUTES must be positive"
            )));
        }
        Ok(())
    }

    /// gRPC listens on the HTTP port + 1, or an ephemeral port when the HTTP
    /// port is ephemeral.
    pub fn grpc_port(&self) -> u16 {
        if self.common.port == 0 {
            0
        } else {
            self.common.port + 1
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let b = &self.billing;
        EngineSettings {
            currency: b.currency.clone(),
            max_attempts: b.max_attempts,
            backoff: BackoffPolicy {
                base_delay: Duration::minutes(b.retry_base_delay_minutes),
                factor: 2,
                max_delay: Duration::minutes(b.retry_max_delay_minutes),
            },
            retry_batch_size: b.retry_batch_size,
            claim_lease: Duration::minutes(b.claim_lease_minutes),
            reminder_window: Duration::days(b.reminder_window_days),
        }
    }
}
