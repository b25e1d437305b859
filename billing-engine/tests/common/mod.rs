//! Test helper module for billing-engine integration tests.
//!
//! Everything runs against the in-memory store with recording fakes for
//! the notification and operator channels.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_engine::config::{
    BillingEngineConfig, BillingSettings, NotificationConfig, SchedulerConfig, StorageBackend,
    StorageConfig,
};
use billing_engine::engine::{BillingEngine, EngineDeps, EngineSettings};
use billing_engine::models::{
    Account, AccountStatus, BillingFieldsUpdate, PaymentStatus,
};
use billing_engine::retry::HandlerRegistry;
use billing_engine::services::notifier::{
    Notification, NotificationSender, NotifyError, OperatorAlert, OperatorChannel,
};
use billing_engine::services::{
    init_metrics, AccountStore, BillingSelection, InvoiceStore, MemoryStore,
};
use billing_engine::startup::Application;
use chrono::{DateTime, Duration, Utc};
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Parse an RFC 3339 timestamp.
pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// An active, fully paid account.
pub fn account(id: &str, role: &str, package_type: &str, created_at: DateTime<Utc>) -> Account {
    Account {
        id: id.to_string(),
        name: format!("Account {}", id),
        phone: Some("+6281200000000".to_string()),
        role: role.to_string(),
        package_type: package_type.to_string(),
        institution_type: "government".to_string(),
        account_status: AccountStatus::Active,
        payment_status: PaymentStatus::Paid,
        created_at,
        last_monthly_invoice_date: None,
        last_annual_invoice_date: None,
        next_billing_date: None,
    }
}

/// An active account created `age_days` before `as_of`.
pub fn aged_account(id: &str, role: &str, package_type: &str, as_of: DateTime<Utc>, age_days: i64) -> Account {
    account(id, role, package_type, as_of - Duration::days(age_days))
}

/// Records every notification and fails delivery for selected accounts.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Notification)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn fail_for(&self, account_id: &str) {
        self.failing.lock().unwrap().insert(account_id.to_string());
    }

    pub fn recover(&self, account_id: &str) {
        self.failing.lock().unwrap().remove(account_id);
    }

    /// Successfully delivered notifications as (account id, notification).
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, account_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| id == account_id)
            .map(|(_, n)| n)
            .collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn notify(
        &self,
        account: &Account,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        if self.failing.lock().unwrap().contains(&account.id) {
            return Err(NotifyError::SendFailed(format!(
                "gateway rejected message for {}",
                account.id
            )));
        }
        self.sent
            .lock()
            .unwrap()
            .push((account.id.clone(), notification.clone()));
        Ok(())
    }
}

/// Account store whose writes can be made to fail per account.
pub struct FlakyAccounts {
    inner: Arc<MemoryStore>,
    fail_billing_fields: Mutex<HashSet<String>>,
    fail_status: Mutex<HashSet<String>>,
}

impl FlakyAccounts {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_billing_fields: Mutex::new(HashSet::new()),
            fail_status: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_billing_fields_for(&self, account_id: &str) {
        self.fail_billing_fields
            .lock()
            .unwrap()
            .insert(account_id.to_string());
    }

    pub fn fail_status_for(&self, account_id: &str) {
        self.fail_status.lock().unwrap().insert(account_id.to_string());
    }

    pub fn recover(&self) {
        self.fail_billing_fields.lock().unwrap().clear();
        self.fail_status.lock().unwrap().clear();
    }
}

#[async_trait]
impl AccountStore for FlakyAccounts {
    async fn find_due_for_billing(
        &self,
        criteria: &BillingSelection,
    ) -> Result<Vec<Account>, AppError> {
        self.inner.find_due_for_billing(criteria).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, AppError> {
        AccountStore::find_by_id(self.inner.as_ref(), id).await
    }

    async fn update_billing_fields(
        &self,
        id: &str,
        fields: &BillingFieldsUpdate,
    ) -> Result<(), AppError> {
        if self.fail_billing_fields.lock().unwrap().contains(id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "primary stepped down"
            )));
        }
        self.inner.update_billing_fields(id, fields).await
    }

    async fn update_status(
        &self,
        id: &str,
        account_status: AccountStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), AppError> {
        if self.fail_status.lock().unwrap().contains(id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "primary stepped down"
            )));
        }
        self.inner
            .update_status(id, account_status, payment_status)
            .await
    }
}

#[derive(Default)]
pub struct RecordingOperators {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingOperators {
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn alerts_for(&self, job_id: &str) -> Vec<OperatorAlert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.reference.as_deref() == Some(job_id))
            .collect()
    }
}

#[async_trait]
impl OperatorChannel for RecordingOperators {
    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// An engine over a fresh in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub operators: Arc<RecordingOperators>,
    pub engine: BillingEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(HandlerRegistry::new())
    }

    /// Handlers in `registry` take precedence over the built-in ones.
    pub fn with_registry(registry: HandlerRegistry) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_parts(store.clone(), store, registry)
    }

    /// Like `with_registry`, with invoice access routed through `invoices`.
    pub fn with_parts(
        store: Arc<MemoryStore>,
        invoices: Arc<dyn InvoiceStore>,
        registry: HandlerRegistry,
    ) -> Self {
        Self::with_stores(store.clone(), store, invoices, registry)
    }

    /// Account and invoice access routed through the given stores; failed
    /// jobs and runs stay in `store`.
    pub fn with_stores(
        store: Arc<MemoryStore>,
        accounts: Arc<dyn AccountStore>,
        invoices: Arc<dyn InvoiceStore>,
        registry: HandlerRegistry,
    ) -> Self {
        init_metrics();
        let notifier = Arc::new(RecordingNotifier::default());
        let operators = Arc::new(RecordingOperators::default());
        let mut deps = EngineDeps::in_memory(store.clone(), notifier.clone(), operators.clone());
        deps.accounts = accounts;
        deps.invoices = invoices;
        let engine = BillingEngine::with_registry(deps, &EngineSettings::default(), registry);
        Self {
            store,
            notifier,
            operators,
            engine,
        }
    }

    pub fn put(&self, account: Account) {
        self.store.put_account(account).expect("seed account");
    }

    pub fn account(&self, id: &str) -> Account {
        self.store
            .accounts()
            .expect("read accounts")
            .into_iter()
            .find(|a| a.id == id)
            .expect("account exists")
    }
}

pub fn test_config() -> BillingEngineConfig {
    BillingEngineConfig {
        common: CoreConfig {
            port: 0,
            environment: "test".to_string(),
        },
        service_name: "billing-engine".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            mongodb: None,
        },
        billing: BillingSettings::default(),
        notifications: NotificationConfig::default(),
        scheduler: SchedulerConfig::default(),
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub http_address: String,
    pub grpc_address: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub harness: Harness,
}

impl TestApp {
    /// Spawn a new test application on random ports.
    pub async fn spawn() -> Self {
        let harness = Harness::new();

        let app = Application::build_with_engine(test_config(), harness.engine.clone())
            .await
            .expect("Failed to build test application");

        let http_port = app.http_port();
        let grpc_port = app.grpc_port();
        let http_address = format!("http://127.0.0.1:{}", http_port);
        let grpc_address = format!("http://127.0.0.1:{}", grpc_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        // Additional wait for gRPC server
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        TestApp {
            http_address,
            grpc_address,
            http_port,
            grpc_port,
            harness,
        }
    }

    /// Create a gRPC client connected to this test app.
    pub async fn grpc_client(
        &self,
    ) -> billing_engine::grpc::proto::billing_engine_service_client::BillingEngineServiceClient<
        tonic::transport::Channel,
    > {
        billing_engine::grpc::proto::billing_engine_service_client::BillingEngineServiceClient::connect(
            self.grpc_address.clone(),
        )
        .await
        .expect("Failed to connect to gRPC server")
    }
}
