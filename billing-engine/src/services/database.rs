//! MongoDB store for billing-engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Document},
    error::{ErrorKind, WriteFailure},
    options::{
        FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions, ReturnDocument,
    },
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;
use tracing::{info, instrument};

use super::metrics::DB_QUERY_DURATION;
use super::store::{
    AccountStore, BillingRunStore, BillingSelection, ClaimExpectation, FailedJobStore,
    InvoiceStore, JobTypeFilter,
};
use crate::models::{
    Account, AccountStatus, BillingFieldsUpdate, BillingRunSummary, FailedJob, FailedJobStatus,
    Invoice, InvoiceStatus, InvoiceType, ListFailedJobsFilter, PaymentStatus,
};

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY
    )
}

fn bson_dt(dt: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(dt)
}

#[derive(Clone)]
pub struct MongoDb {
    client: MongoClient,
    db: Database,
}

impl MongoDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            AppError::from(e)
        })?;
        let db = client.database(database);
        info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    /// Create the uniqueness and query indexes. Idempotent.
    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        info!("Creating MongoDB indexes for billing-engine");

        let invoice_period = IndexModel::builder()
            .keys(doc! { "account_id": 1, "invoice_type": 1, "billing_period": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_account_period_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        let invoice_pending = IndexModel::builder()
            .keys(doc! { "status": 1, "due_date": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_status_due".to_string())
                    .build(),
            )
            .build();
        self.invoices()
            .create_indexes([invoice_period, invoice_pending], None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create invoice indexes");
                AppError::from(e)
            })?;
        info!("Created indexes on invoices");

        let account_selection = IndexModel::builder()
            .keys(doc! { "account_status": 1, "role": 1, "package_type": 1, "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("account_billing_selection".to_string())
                    .build(),
            )
            .build();
        self.accounts()
            .create_index(account_selection, None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create account index");
                AppError::from(e)
            })?;
        info!("Created index on accounts.(account_status, role, package_type, created_at)");

        let job_due = IndexModel::builder()
            .keys(doc! { "status": 1, "next_retry_at": 1, "scheduled_time": 1 })
            .options(
                IndexOptions::builder()
                    .name("failed_job_due".to_string())
                    .build(),
            )
            .build();
        let job_type = IndexModel::builder()
            .keys(doc! { "job_type": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("failed_job_type".to_string())
                    .build(),
            )
            .build();
        self.failed_jobs()
            .create_indexes([job_due, job_type], None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create failed_jobs indexes");
                AppError::from(e)
            })?;
        info!("Created indexes on failed_jobs");

        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "MongoDB health check failed");
                AppError::from(e)
            })?;
        timer.observe_duration();
        Ok(())
    }

    pub fn accounts(&self) -> Collection<Account> {
        self.db.collection("accounts")
    }

    pub fn invoices(&self) -> Collection<Invoice> {
        self.db.collection("invoices")
    }

    pub fn failed_jobs(&self) -> Collection<FailedJob> {
        self.db.collection("failed_jobs")
    }

    pub fn billing_runs(&self) -> Collection<BillingRunSummary> {
        self.db.collection("billing_runs")
    }
}

#[async_trait]
impl AccountStore for MongoDb {
    #[instrument(skip(self, criteria), fields(created_before = %criteria.created_before))]
    async fn find_due_for_billing(
        &self,
        criteria: &BillingSelection,
    ) -> Result<Vec<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_due_for_billing"])
            .start_timer();

        let filter = doc! {
            "account_status": AccountStatus::Active.as_str(),
            "role": { "$in": criteria.roles.clone() },
            "package_type": { "$in": criteria.package_types.clone() },
            "created_at": { "$lte": bson_dt(criteria.created_before) },
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1, "_id": 1 })
            .build();

        let accounts: Vec<Account> = self
            .accounts()
            .find(filter, Some(options))
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        info!(count = accounts.len(), "Selected accounts for billing");
        Ok(accounts)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_account"])
            .start_timer();
        let account = self.accounts().find_one(doc! { "_id": id }, None).await?;
        timer.observe_duration();
        Ok(account)
    }

    #[instrument(skip(self, update), fields(cycle = %update.cycle))]
    async fn update_billing_fields(
        &self,
        id: &str,
        update: &BillingFieldsUpdate,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_billing_fields"])
            .start_timer();

        let mut set = Document::new();
        set.insert(update.last_invoice_field(), bson_dt(update.last_invoice_date));
        set.insert("next_billing_date", bson_dt(update.next_billing_date));
        set.insert("updated_at", bson_dt(Utc::now()));

        let result = self
            .accounts()
            .update_one(doc! { "_id": id }, doc! { "$set": set }, None)
            .await?;
        timer.observe_duration();

        if result.matched_count == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("Account {} not found", id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: &str,
        account_status: AccountStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_account_status"])
            .start_timer();

        let result = self
            .accounts()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": {
                    "account_status": account_status.as_str(),
                    "payment_status": payment_status.as_str(),
                    "updated_at": bson_dt(Utc::now()),
                }},
                None,
            )
            .await?;
        timer.observe_duration();

        if result.matched_count == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("Account {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for MongoDb {
    #[instrument(skip(self))]
    async fn find_existing(
        &self,
        account_id: &str,
        invoice_type: InvoiceType,
        billing_period: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_existing_invoice"])
            .start_timer();
        let invoice = self
            .invoices()
            .find_one(
                doc! {
                    "account_id": account_id,
                    "invoice_type": invoice_type.as_str(),
                    "billing_period": billing_period,
                },
                None,
            )
            .await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, invoice), fields(account_id = %invoice.account_id, billing_period = %invoice.billing_period))]
    async fn create(&self, invoice: &Invoice) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        match self.invoices().insert_one(invoice, None).await {
            Ok(_) => {
                timer.observe_duration();
                Ok(())
            }
            Err(e) if is_duplicate_key(&e) => Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice for account {} period {} already exists",
                invoice.account_id,
                invoice.billing_period
            ))),
            Err(e) => Err(AppError::from(e)),
        }
    }

    #[instrument(skip(self))]
    async fn find_pending(&self, due_before: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_pending_invoices"])
            .start_timer();

        let options = FindOptions::builder().sort(doc! { "due_date": 1 }).build();
        let invoices: Vec<Invoice> = self
            .invoices()
            .find(
                doc! {
                    "status": InvoiceStatus::Pending.as_str(),
                    "due_date": { "$lt": bson_dt(due_before) },
                },
                Some(options),
            )
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn mark_overdue(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_overdue"])
            .start_timer();

        let result = self
            .invoices()
            .update_one(
                doc! { "_id": id, "status": InvoiceStatus::Pending.as_str() },
                doc! { "$set": {
                    "status": InvoiceStatus::Overdue.as_str(),
                    "updated_at": bson_dt(now),
                }},
                None,
            )
            .await?;

        timer.observe_duration();
        Ok(result.modified_count == 1)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice"])
            .start_timer();
        let invoice = self.invoices().find_one(doc! { "_id": id }, None).await?;
        timer.observe_duration();
        Ok(invoice)
    }
}

#[async_trait]
impl FailedJobStore for MongoDb {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    async fn insert(&self, job: &FailedJob) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_failed_job"])
            .start_timer();
        self.failed_jobs().insert_one(job, None).await?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, job_types))]
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        job_types: JobTypeFilter<'_>,
        limit: i64,
    ) -> Result<Vec<FailedJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_due_failed_jobs"])
            .start_timer();

        let type_filter = match job_types {
            JobTypeFilter::Only(types) => doc! { "$in": types.to_vec() },
            JobTypeFilter::Except(types) => doc! { "$nin": types.to_vec() },
        };
        let filter = doc! {
            "status": {
                "$in": [FailedJobStatus::Pending.as_str(), FailedJobStatus::Retrying.as_str()]
            },
            "job_type": type_filter,
            "next_retry_at": { "$lte": bson_dt(now) },
            "$expr": { "$lt": ["$attempt_count", "$max_attempts"] },
        };
        let options = FindOptions::builder()
            .sort(doc! { "scheduled_time": 1, "created_at": 1 })
            .limit(limit)
            .build();

        let jobs: Vec<FailedJob> = self
            .failed_jobs()
            .find(filter, Some(options))
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn find_expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FailedJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_expired_claims"])
            .start_timer();

        let filter = doc! {
            "status": FailedJobStatus::Retrying.as_str(),
            "next_retry_at": { "$lte": bson_dt(now) },
            "$expr": { "$gte": ["$attempt_count", "$max_attempts"] },
        };
        let options = FindOptions::builder()
            .sort(doc! { "scheduled_time": 1, "created_at": 1 })
            .limit(limit)
            .build();

        let jobs: Vec<FailedJob> = self
            .failed_jobs()
            .find(filter, Some(options))
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        Ok(jobs)
    }

    #[instrument(skip(self, expected), fields(expected_status = %expected.status.as_str(), expected_attempt = expected.attempt_count))]
    async fn claim(
        &self,
        id: &str,
        expected: ClaimExpectation,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<FailedJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_failed_job"])
            .start_timer();

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let claimed = self
            .failed_jobs()
            .find_one_and_update(
                doc! {
                    "_id": id,
                    "status": expected.status.as_str(),
                    "attempt_count": (expected.attempt_count as i64),
                },
                doc! {
                    "$set": {
                        "status": FailedJobStatus::Retrying.as_str(),
                        "last_attempt_at": bson_dt(now),
                        "next_retry_at": bson_dt(lease_until),
                        "updated_at": bson_dt(now),
                    },
                    "$inc": { "attempt_count": 1 },
                },
                Some(options),
            )
            .await?;

        timer.observe_duration();
        Ok(claimed)
    }

    #[instrument(skip(self, job, expected), fields(job_id = %job.id, status = %job.status.as_str()))]
    async fn update(
        &self,
        job: &FailedJob,
        expected: ClaimExpectation,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_failed_job"])
            .start_timer();
        let result = self
            .failed_jobs()
            .replace_one(
                doc! {
                    "_id": &job.id,
                    "status": expected.status.as_str(),
                    "attempt_count": (expected.attempt_count as i64),
                },
                job,
                None,
            )
            .await?;
        timer.observe_duration();

        if result.matched_count == 1 {
            return Ok(true);
        }
        let exists = self
            .failed_jobs()
            .find_one(doc! { "_id": &job.id }, None)
            .await?
            .is_some();
        if !exists {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Failed job {} not found",
                job.id
            )));
        }
        Ok(false)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> Result<Option<FailedJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_failed_job"])
            .start_timer();
        let job = self.failed_jobs().find_one(doc! { "_id": id }, None).await?;
        timer.observe_duration();
        Ok(job)
    }

    #[instrument(skip(self, filter))]
    async fn list(&self, filter: &ListFailedJobsFilter) -> Result<Vec<FailedJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_failed_jobs"])
            .start_timer();

        let mut query = Document::new();
        if let Some(status) = filter.status {
            query.insert("status", status.as_str());
        }
        if let Some(job_type) = &filter.job_type {
            query.insert("job_type", job_type.as_str());
        }
        let mut options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();
        if filter.limit > 0 {
            options.limit = Some(filter.limit);
        }

        let jobs: Vec<FailedJob> = self
            .failed_jobs()
            .find(query, Some(options))
            .await?
            .try_collect()
            .await?;

        timer.observe_duration();
        Ok(jobs)
    }
}

#[async_trait]
impl BillingRunStore for MongoDb {
    #[instrument(skip(self, summary), fields(run_id = %summary.run_id))]
    async fn save(&self, summary: &BillingRunSummary) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_billing_run"])
            .start_timer();
        let options = ReplaceOptions::builder().upsert(true).build();
        self.billing_runs()
            .replace_one(doc! { "_id": &summary.run_id }, summary, Some(options))
            .await?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, run_id: &str) -> Result<Option<BillingRunSummary>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_billing_run"])
            .start_timer();
        let run = self
            .billing_runs()
            .find_one(doc! { "_id": run_id }, None)
            .await?;
        timer.observe_duration();
        Ok(run)
    }
}
