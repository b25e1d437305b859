//! Account notifications and operator escalation.
//!
//! Delivery is owned by the notification platform; the engine posts JSON to
//! its HTTP endpoints, or only logs when no endpoint is configured.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Serialize;
use service_core::observability::TracedRequestExt;
use std::time::Duration;
use thiserror::Error;

use crate::models::Account;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl NotifyError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Connection(_) | NotifyError::SendFailed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Message addressed to an account holder.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub action_ref: Option<String>,
}

/// Message addressed to the operators.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorAlert {
    pub severity: Severity,
    pub subject: String,
    pub message: String,
    pub reference: Option<String>,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(&self, account: &Account, notification: &Notification)
        -> Result<(), NotifyError>;
}

#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<(), NotifyError>;
}

#[derive(Debug, Serialize)]
struct AccountNotificationRequest<'a> {
    account_id: &'a str,
    name: &'a str,
    phone: Option<&'a str>,
    title: &'a str,
    message: &'a str,
    severity: Severity,
    action_ref: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OperatorAlertRequest<'a> {
    severity: Severity,
    subject: &'a str,
    message: &'a str,
    reference: Option<&'a str>,
    source: &'static str,
}

fn build_client(timeout: Duration) -> Result<Client, NotifyError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NotifyError::Connection(format!("Failed to build HTTP client: {}", e)))
}

async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    body: &T,
) -> Result<(), NotifyError> {
    let response = client
        .post(url)
        .with_trace_context(None)
        .json(body)
        .send()
        .await
        .map_err(|e| NotifyError::Connection(format!("Failed to reach {}: {}", url, e)))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let text = response.text().await.unwrap_or_default();
    if status.is_server_error() || status.as_u16() == 429 {
        Err(NotifyError::SendFailed(format!("{} returned {}: {}", url, status, text)))
    } else {
        Err(NotifyError::Rejected(format!("{} returned {}: {}", url, status, text)))
    }
}

/// Posts account notifications to the notification platform.
pub struct HttpNotificationSender {
    client: Client,
    url: String,
}

impl HttpNotificationSender {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    async fn notify(
        &self,
        account: &Account,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        let phone = account.phone.as_deref().filter(|p| !p.trim().is_empty());
        if phone.is_none() {
            return Err(NotifyError::InvalidRecipient(format!(
                "Account {} has no phone number",
                account.id
            )));
        }

        let request = AccountNotificationRequest {
            account_id: &account.id,
            name: &account.name,
            phone,
            title: &notification.title,
            message: &notification.message,
            severity: notification.severity,
            action_ref: notification.action_ref.as_deref(),
        };
        post_json(&self.client, &self.url, &request).await?;

        tracing::debug!(account_id = %account.id, title = %notification.title, "Notification sent");
        Ok(())
    }
}

/// Posts operator alerts to an incident webhook, retrying transient errors.
pub struct HttpOperatorChannel {
    client: Client,
    url: String,
    max_elapsed: Duration,
}

impl HttpOperatorChannel {
    pub fn new(url: &str, timeout: Duration, max_elapsed: Duration) -> Result<Self, NotifyError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
            max_elapsed,
        })
    }
}

#[async_trait]
impl OperatorChannel for HttpOperatorChannel {
    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        let request = OperatorAlertRequest {
            severity: alert.severity,
            subject: &alert.subject,
            message: &alert.message,
            reference: alert.reference.as_deref(),
            source: "billing-engine",
        };

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        retry(policy, || async {
            post_json(&self.client, &self.url, &request)
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        tracing::warn!(error = %e, "Operator alert failed, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        })
        .await
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn notify(
        &self,
        account: &Account,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            account_id = %account.id,
            title = %notification.title,
            severity = notification.severity.as_str(),
            action_ref = ?notification.action_ref,
            "Notification (log only): {}",
            notification.message
        );
        Ok(())
    }
}

/// Writes operator alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOperatorChannel;

#[async_trait]
impl OperatorChannel for LogOperatorChannel {
    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        match alert.severity {
            Severity::Critical => tracing::error!(
                subject = %alert.subject,
                reference = ?alert.reference,
                "Operator alert: {}",
                alert.message
            ),
            _ => tracing::warn!(
                subject = %alert.subject,
                reference = ?alert.reference,
                "Operator alert: {}",
                alert.message
            ),
        }
        Ok(())
    }
}
