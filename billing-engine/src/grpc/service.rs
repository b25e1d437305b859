//! BillingEngineService gRPC implementation.

use crate::engine::BillingEngine;
use crate::grpc::proto::billing_engine_service_server::BillingEngineService;
use crate::grpc::proto::*;
use crate::models::{FailedJobStatus, ListFailedJobsFilter};
use crate::services::metrics::record_error;
use crate::services::{record_grpc_request, record_grpc_request_duration};
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use service_core::error::AppError;
use service_core::grpc::IntoStatus;
use std::time::Instant;
use tonic::{Request, Response, Status};

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

/// BillingEngineService implementation.
pub struct BillingEngineServiceImpl {
    engine: BillingEngine,
}

impl BillingEngineServiceImpl {
    pub fn new(engine: BillingEngine) -> Self {
        Self { engine }
    }
}

fn datetime_to_timestamp(dt: DateTime<Utc>) -> Option<Timestamp> {
    Some(Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    })
}

/// A missing timestamp means "now"; an out-of-range one is rejected.
#[allow(clippy::result_large_err)]
fn timestamp_or_now(ts: Option<Timestamp>, field: &str) -> Result<DateTime<Utc>, Status> {
    match ts {
        None => Ok(Utc::now()),
        Some(t) => DateTime::from_timestamp(t.seconds, t.nanos.max(0) as u32)
            .ok_or_else(|| Status::invalid_argument(format!("Invalid timestamp: {}", field))),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn finish<T>(method: &str, start: Instant, result: Result<T, AppError>) -> Result<T, Status> {
    record_grpc_request_duration(method, start.elapsed().as_secs_f64());
    match result {
        Ok(value) => {
            record_grpc_request(method, "ok");
            Ok(value)
        }
        Err(e) => {
            record_error(error_kind(&e), method);
            record_grpc_request(method, "error");
            Err(e.into_status())
        }
    }
}

fn error_kind(e: &AppError) -> &'static str {
    match e {
        AppError::BadRequest(_) => "bad_request",
        AppError::NotFound(_) => "not_found",
        AppError::Conflict(_) => "conflict",
        AppError::FailedPrecondition(_) => "failed_precondition",
        AppError::DatabaseError(_) => "database",
        AppError::BadGateway(_) | AppError::ServiceUnavailable => "unavailable",
        AppError::InternalError(_) | AppError::ConfigError(_) => "internal",
    }
}

fn run_mode_to_proto(mode: crate::models::RunMode) -> RunMode {
    match mode {
        crate::models::RunMode::DryRun => RunMode::DryRun,
        crate::models::RunMode::Live => RunMode::Live,
    }
}

fn breakdown_to_proto(b: &crate::models::RunBreakdown) -> RunBreakdown {
    RunBreakdown {
        checked: b.checked,
        billed: b.billed,
        skipped: b.skipped,
        failed: b.failed,
        amount_billed: b.amount_billed,
    }
}

fn run_to_proto(r: crate::models::BillingRunSummary) -> BillingRunSummary {
    let idle_reason = r.idle_reason().unwrap_or_default().to_string();
    BillingRunSummary {
        run_id: r.run_id,
        mode: run_mode_to_proto(r.mode) as i32,
        as_of: datetime_to_timestamp(r.as_of),
        started_at: datetime_to_timestamp(r.started_at),
        completed_at: r.completed_at.and_then(datetime_to_timestamp),
        checked: r.checked,
        billed: r.billed,
        skipped: r.skipped,
        skipped_not_due: r.skipped_not_due,
        skipped_already_invoiced: r.skipped_already_invoiced,
        failed: r.failed,
        notification_failures: r.notification_failures,
        ledger_errors: r.ledger_errors,
        by_package: r
            .by_package
            .iter()
            .map(|(k, v)| (k.clone(), breakdown_to_proto(v)))
            .collect(),
        by_role: r
            .by_role
            .iter()
            .map(|(k, v)| (k.clone(), breakdown_to_proto(v)))
            .collect(),
        invoices: r
            .invoices
            .into_iter()
            .map(|i| InvoiceRef {
                invoice_id: i.invoice_id,
                account_id: i.account_id,
                billing_period: i.billing_period,
                amount: i.amount,
                planned: i.planned,
            })
            .collect(),
        failures: r
            .failures
            .into_iter()
            .map(|f| AccountFailure {
                account_id: f.account_id,
                error: f.error,
                failed_job_id: f.failed_job_id.unwrap_or_default(),
            })
            .collect(),
        idle_reason,
    }
}

fn job_to_proto(j: crate::models::FailedJob) -> FailedJob {
    FailedJob {
        id: j.id,
        job_type: j.job_type,
        scheduled_time: datetime_to_timestamp(j.scheduled_time),
        attempt_count: j.attempt_count,
        max_attempts: j.max_attempts,
        last_attempt_at: j.last_attempt_at.and_then(datetime_to_timestamp),
        next_retry_at: j.next_retry_at.and_then(datetime_to_timestamp),
        status: j.status.as_str().to_string(),
        error_message: j.error_message,
        affected_entities: j
            .affected_entities
            .into_iter()
            .map(|e| AffectedEntity {
                entity_id: e.entity_id,
                entity_type: e.entity_type,
                status: e.status.as_str().to_string(),
                error: e.error.unwrap_or_default(),
            })
            .collect(),
        metadata: j.metadata.to_string(),
        resolved_at: j.resolved_at.and_then(datetime_to_timestamp),
        resolution: j.resolution.unwrap_or_default(),
        created_at: datetime_to_timestamp(j.created_at),
        updated_at: datetime_to_timestamp(j.updated_at),
    }
}

fn retry_summary_to_proto(s: crate::models::RetrySummary) -> RetrySummary {
    RetrySummary {
        retried: s.retried,
        succeeded: s.succeeded,
        failed: s.failed,
        max_attempts_reached: s.max_attempts_reached,
        skipped_unknown: s.skipped_unknown,
        claim_conflicts: s.claim_conflicts,
    }
}

#[tonic::async_trait]
impl BillingEngineService for BillingEngineServiceImpl {
    #[tracing::instrument(skip(self, request), fields(method = "RunBillingCycle"))]
    async fn run_billing_cycle(
        &self,
        request: Request<RunBillingCycleRequest>,
    ) -> Result<Response<RunBillingCycleResponse>, Status> {
        let start = Instant::now();
        let method = "RunBillingCycle";

        let req = request.into_inner();
        let as_of = timestamp_or_now(req.as_of, "as_of")?;
        let mode = match req.mode() {
            RunMode::Live => crate::models::RunMode::Live,
            RunMode::DryRun | RunMode::Unspecified => crate::models::RunMode::DryRun,
        };
        tracing::info!(as_of = %as_of, mode = mode.as_str(), "Billing cycle requested");

        let result = self.engine.processor.run_billing_cycle(as_of, mode).await;
        let summary = finish(method, start, result)?;

        Ok(Response::new(RunBillingCycleResponse {
            summary: Some(run_to_proto(summary)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "GetBillingRun"))]
    async fn get_billing_run(
        &self,
        request: Request<GetBillingRunRequest>,
    ) -> Result<Response<GetBillingRunResponse>, Status> {
        let start = Instant::now();
        let method = "GetBillingRun";

        let req = request.into_inner();
        if req.run_id.trim().is_empty() {
            return Err(Status::invalid_argument("run_id is required"));
        }

        let result = match self.engine.runs.find_by_id(&req.run_id).await {
            Ok(Some(run)) => Ok(run),
            Ok(None) => Err(AppError::NotFound(anyhow::anyhow!(
                "Billing run {} not found",
                req.run_id
            ))),
            Err(e) => Err(e),
        };
        let run = finish(method, start, result)?;

        Ok(Response::new(GetBillingRunResponse {
            summary: Some(run_to_proto(run)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "RetryDueJobs"))]
    async fn retry_due_jobs(
        &self,
        request: Request<RetryDueJobsRequest>,
    ) -> Result<Response<RetryDueJobsResponse>, Status> {
        let start = Instant::now();
        let method = "RetryDueJobs";

        let now = timestamp_or_now(request.into_inner().now, "now")?;
        let result = self.engine.worker.retry_due_jobs(now).await;
        let summary = finish(method, start, result)?;

        Ok(Response::new(RetryDueJobsResponse {
            summary: Some(retry_summary_to_proto(summary)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "ListFailedJobs"))]
    async fn list_failed_jobs(
        &self,
        request: Request<ListFailedJobsRequest>,
    ) -> Result<Response<ListFailedJobsResponse>, Status> {
        let start = Instant::now();
        let method = "ListFailedJobs";

        let req = request.into_inner();
        let status = match non_empty(req.status) {
            Some(s) => Some(FailedJobStatus::from_string(&s).ok_or_else(|| {
                Status::invalid_argument(format!("Invalid failed job status: {}", s))
            })?),
            None => None,
        };
        let limit = if req.limit > 0 {
            (req.limit as i64).min(MAX_LIST_LIMIT)
        } else {
            DEFAULT_LIST_LIMIT
        };
        let filter = ListFailedJobsFilter {
            status,
            job_type: non_empty(req.job_type),
            limit,
        };

        let result = self.engine.ledger.list(&filter).await;
        let jobs = finish(method, start, result)?;

        Ok(Response::new(ListFailedJobsResponse {
            jobs: jobs.into_iter().map(job_to_proto).collect(),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "ResolveFailedJob"))]
    async fn resolve_failed_job(
        &self,
        request: Request<ResolveFailedJobRequest>,
    ) -> Result<Response<ResolveFailedJobResponse>, Status> {
        let start = Instant::now();
        let method = "ResolveFailedJob";

        let req = request.into_inner();
        if req.job_id.trim().is_empty() {
            return Err(Status::invalid_argument("job_id is required"));
        }
        let resolution = non_empty(req.resolution).unwrap_or_else(|| "resolved manually".to_string());
        tracing::info!(job_id = %req.job_id, "Resolving failed job");

        let result = self
            .engine
            .ledger
            .resolve(&req.job_id, &resolution, Utc::now())
            .await;
        let job = finish(method, start, result)?;

        Ok(Response::new(ResolveFailedJobResponse {
            job: Some(job_to_proto(job)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "SendPaymentReminders"))]
    async fn send_payment_reminders(
        &self,
        request: Request<SendPaymentRemindersRequest>,
    ) -> Result<Response<SendPaymentRemindersResponse>, Status> {
        let start = Instant::now();
        let method = "SendPaymentReminders";

        let now = timestamp_or_now(request.into_inner().now, "now")?;
        let result = self.engine.reminders.send_payment_reminders(now).await;
        let summary = finish(method, start, result)?;

        Ok(Response::new(SendPaymentRemindersResponse {
            checked: summary.checked,
            sent: summary.sent,
            failed: summary.failed,
            skipped: summary.skipped,
            failed_job_id: summary.failed_job_id.unwrap_or_default(),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "SweepOverdue"))]
    async fn sweep_overdue(
        &self,
        request: Request<SweepOverdueRequest>,
    ) -> Result<Response<SweepOverdueResponse>, Status> {
        let start = Instant::now();
        let method = "SweepOverdue";

        let now = timestamp_or_now(request.into_inner().now, "now")?;
        let result = self.engine.overdue.sweep_overdue(now).await;
        let summary = finish(method, start, result)?;

        Ok(Response::new(SweepOverdueResponse {
            checked: summary.checked,
            marked_overdue: summary.marked_overdue,
            accounts_updated: summary.accounts_updated,
            failed: summary.failed,
            failed_job_id: summary.failed_job_id.unwrap_or_default(),
        }))
    }
}
