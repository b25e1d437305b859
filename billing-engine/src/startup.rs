//! Application startup and lifecycle management.

use crate::config::{BillingEngineConfig, StorageBackend};
use crate::engine::{BillingEngine, EngineDeps};
use crate::grpc::{
    proto::{billing_engine_service_server::BillingEngineServiceServer, FILE_DESCRIPTOR_SET},
    BillingEngineServiceImpl,
};
use crate::scheduler::Scheduler;
use crate::services::notifier::{
    HttpNotificationSender, HttpOperatorChannel, LogNotificationSender, LogOperatorChannel,
    NotificationSender, OperatorChannel,
};
use crate::services::{get_metrics, init_metrics, MemoryStore, MongoDb};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::Server as GrpcServer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// State for health check endpoints. `db` is absent on the in-memory backend.
#[derive(Clone)]
struct HealthState {
    service_name: String,
    db: Option<Arc<MongoDb>>,
}

impl HealthState {
    async fn check(&self) -> Result<(), AppError> {
        match &self.db {
            Some(db) => db.health_check().await,
            None => Ok(()),
        }
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.service_name,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

fn notification_channels(
    config: &BillingEngineConfig,
) -> Result<(Arc<dyn NotificationSender>, Arc<dyn OperatorChannel>), AppError> {
    let n = &config.notifications;
    let timeout = Duration::from_secs(n.timeout_secs);

    let notifier: Arc<dyn NotificationSender> = match &n.notify_url {
        Some(url) => Arc::new(
            HttpNotificationSender::new(url, timeout)
                .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?,
        ),
        None => {
            tracing::warn!("NOTIFICATION_URL not set, account notifications are only logged");
            Arc::new(LogNotificationSender)
        }
    };

    let operators: Arc<dyn OperatorChannel> = match &n.operator_webhook_url {
        Some(url) => Arc::new(
            HttpOperatorChannel::new(
                url,
                timeout,
                Duration::from_secs(n.operator_retry_max_secs),
            )
            .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?,
        ),
        None => {
            tracing::warn!("OPERATOR_WEBHOOK_URL not set, operator alerts are only logged");
            Arc::new(LogOperatorChannel)
        }
    };

    Ok((notifier, operators))
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    service_name: String,
    db: Option<Arc<MongoDb>>,
    engine: BillingEngine,
    scheduler: Scheduler,
}

impl Application {
    /// Build the application with the configured storage backend.
    pub async fn build(config: BillingEngineConfig) -> Result<Self, AppError> {
        init_metrics();

        let (notifier, operators) = notification_channels(&config)?;
        let settings = config.engine_settings();

        let (deps, db) = match config.storage.backend {
            StorageBackend::Mongodb => {
                let mongo = config.storage.mongodb.as_ref().ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!("MongoDB storage selected without settings"))
                })?;
                let db = MongoDb::connect(&mongo.uri, &mongo.database)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Failed to connect to MongoDB");
                        e
                    })?;
                db.initialize_indexes().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to initialize indexes");
                    e
                })?;
                let db = Arc::new(db);
                let deps = EngineDeps {
                    accounts: db.clone(),
                    invoices: db.clone(),
                    failed_jobs: db.clone(),
                    runs: db.clone(),
                    notifier,
                    operators,
                };
                (deps, Some(db))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage, data is lost on restart");
                let store = Arc::new(MemoryStore::new());
                (EngineDeps::in_memory(store, notifier, operators), None)
            }
        };

        let engine = BillingEngine::new(deps, &settings);
        Self::bind(config, engine, db).await
    }

    /// Build the application around an already assembled engine.
    pub async fn build_with_engine(
        config: BillingEngineConfig,
        engine: BillingEngine,
    ) -> Result<Self, AppError> {
        init_metrics();
        Self::bind(config, engine, None).await
    }

    async fn bind(
        config: BillingEngineConfig,
        engine: BillingEngine,
        db: Option<Arc<MongoDb>>,
    ) -> Result<Self, AppError> {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port()));
        let grpc_listener = TcpListener::bind(grpc_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %grpc_addr, "Failed to bind gRPC listener");
            AppError::from(e)
        })?;
        let grpc_port = grpc_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            "Billing engine listeners bound"
        );

        let scheduler = Scheduler::new(config.scheduler.clone(), engine.clone());

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            service_name: config.service_name,
            db,
            engine,
            scheduler,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the gRPC port the server is listening on.
    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    pub fn engine(&self) -> &BillingEngine {
        &self.engine
    }

    /// Run the servers and the scheduler until one of the servers stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            service_name: self.service_name.clone(),
            db: self.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let engine_service = BillingEngineServiceImpl::new(self.engine.clone());

        // gRPC health service
        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<BillingEngineServiceServer<BillingEngineServiceImpl>>()
            .await;

        // Reflection service for debugging
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| {
                std::io::Error::other(format!("Failed to build reflection service: {}", e))
            })?;

        let grpc_trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServer::builder()
            .layer(grpc_trace_layer)
            .add_service(grpc_health_service)
            .add_service(reflection_service)
            .add_service(BillingEngineServiceServer::new(engine_service))
            .serve_with_incoming(incoming);

        let scheduler_handles = self.scheduler.start();

        tracing::info!(
            service = %self.service_name,
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            grpc_port = self.grpc_port,
            scheduled_triggers = scheduler_handles.len(),
            "Service ready to accept connections"
        );

        let result = tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                result.map_err(|e| {
                    tracing::error!(error = %e, "HTTP server error");
                    std::io::Error::other(format!("HTTP server error: {}", e))
                })
            }
            result = grpc_server => {
                result.map_err(|e| {
                    tracing::error!(error = %e, "gRPC server error");
                    std::io::Error::other(format!("gRPC server error: {}", e))
                })
            }
        };

        self.scheduler.shutdown();
        for handle in scheduler_handles {
            let _ = handle.await;
        }

        result
    }
}
