//! In-process scheduler for the periodic engine jobs.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::engine::BillingEngine;
use crate::models::RunMode;

pub struct Scheduler {
    config: SchedulerConfig,
    engine: BillingEngine,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, engine: BillingEngine) -> Self {
        Self {
            config,
            engine,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Spawn one task per trigger. Returns no handles when disabled.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("Scheduler disabled by configuration");
            return Vec::new();
        }

        tracing::info!(
            billing_interval_secs = self.config.billing_interval_secs,
            retry_interval_secs = self.config.retry_interval_secs,
            reminder_interval_secs = self.config.reminder_interval_secs,
            overdue_interval_secs = self.config.overdue_interval_secs,
            "Starting scheduler"
        );

        let billing = self.engine.processor.clone();
        let worker = self.engine.worker.clone();
        let reminders = self.engine.reminders.clone();
        let overdue = self.engine.overdue.clone();

        vec![
            self.spawn_trigger("billing_cycle", self.config.billing_interval_secs, move || {
                let billing = billing.clone();
                async move {
                    billing
                        .run_billing_cycle(Utc::now(), RunMode::Live)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            }),
            self.spawn_trigger("retry_sweep", self.config.retry_interval_secs, move || {
                let worker = worker.clone();
                async move {
                    worker
                        .retry_due_jobs(Utc::now())
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            }),
            self.spawn_trigger(
                "payment_reminders",
                self.config.reminder_interval_secs,
                move || {
                    let reminders = reminders.clone();
                    async move {
                        reminders
                            .send_payment_reminders(Utc::now())
                            .await
                            .map(|_| ())
                            .map_err(|e| e.to_string())
                    }
                },
            ),
            self.spawn_trigger("overdue_sweep", self.config.overdue_interval_secs, move || {
                let overdue = overdue.clone();
                async move {
                    overdue
                        .sweep_overdue(Utc::now())
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            }),
        ]
    }

    /// Each tick awaits the previous run, so a trigger never overlaps itself.
    fn spawn_trigger<F, Fut>(&self, name: &'static str, every_secs: u64, run: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(every_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(trigger = name, "Scheduler trigger shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        tracing::debug!(trigger = name, "Scheduler trigger fired");
                        if let Err(e) = run().await {
                            tracing::error!(trigger = name, error = %e, "Scheduled job failed");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();
    }
}
