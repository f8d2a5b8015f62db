//! Recurring append of the newest unrecorded window from the live account.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use idh_adapters::StatisticsSource;
use idh_core::{HarvestError, OrgId, TimeRange};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::lease::LeaseStore;
use crate::reconcile::{canonicalize, flatten_all};
use crate::warehouse::{BatchLoader, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Fetch(TimeRange),
    Skip,
}

/// `[watermark + 1h, now)`, or a skip when that window is empty or inverted.
pub fn compute_window(watermark: DateTime<Utc>, now: DateTime<Utc>) -> WindowDecision {
    let from = watermark + Duration::hours(1);
    if now <= from {
        WindowDecision::Skip
    } else {
        WindowDecision::Fetch(TimeRange { from, to: now })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    EmptyWindow,
    LeaseHeld,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub window: TimeRange,
    pub observations: usize,
    pub metric_rows: usize,
    pub insert_calls: usize,
    pub purged_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Synced(SyncReport),
}

/// Opaque payload delivered with each trigger. Only its arrival matters.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    pub payload: Vec<u8>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct IncrementalSync {
    source: Arc<dyn StatisticsSource>,
    sink: Arc<dyn Warehouse>,
    leases: Arc<dyn LeaseStore>,
    loader: BatchLoader,
    org: OrgId,
    lease_key: String,
    lease_ttl: std::time::Duration,
    holder_id: String,
    retention: Duration,
    running: AtomicBool,
}

impl IncrementalSync {
    pub fn new(
        config: &HarvestConfig,
        source: Arc<dyn StatisticsSource>,
        sink: Arc<dyn Warehouse>,
        leases: Arc<dyn LeaseStore>,
    ) -> Result<Self, HarvestError> {
        config.validate()?;
        Ok(Self {
            loader: BatchLoader::new(sink.clone(), config.batch_limit()?, config.sink_delay()),
            source,
            sink,
            leases,
            org: config.current_org.clone(),
            lease_key: format!("{}.{}", config.dataset, config.metrics_table),
            lease_ttl: config.lease_ttl(),
            holder_id: Uuid::new_v4().to_string(),
            retention: config.retention(),
            running: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SyncState {
        if self.running.load(Ordering::Acquire) {
            SyncState::Running
        } else {
            SyncState::Idle
        }
    }

    pub async fn handle_trigger(&self, trigger: Trigger) -> Result<SyncOutcome, HarvestError> {
        info!(payload_bytes = trigger.payload.len(), "sync triggered");
        self.run_at(Utc::now()).await
    }

    /// One Idle → Running → Idle cycle ending at `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncOutcome, HarvestError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("previous sync still running; trigger skipped");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _running = RunningGuard(&self.running);

        let span = info_span!("incremental_sync", org = %self.org, lease = %self.lease_key);
        async {
            let Some(lease) = self
                .leases
                .try_acquire(&self.lease_key, &self.holder_id, self.lease_ttl)
                .await?
            else {
                warn!("sync lease held elsewhere; trigger skipped");
                return Ok(SyncOutcome::Skipped(SkipReason::LeaseHeld));
            };

            let result = self.sync_window(now).await;
            if let Err(err) = self.leases.release(&lease).await {
                warn!(error = %err, "failed to release sync lease; it expires on its own");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn sync_window(&self, now: DateTime<Utc>) -> Result<SyncOutcome, HarvestError> {
        let watermark = self.sink.watermark().await?.ok_or_else(|| {
            HarvestError::Configuration(format!(
                "no watermark in {}; run the backfill first",
                self.lease_key
            ))
        })?;

        let window = match compute_window(watermark, now) {
            WindowDecision::Fetch(window) => window,
            WindowDecision::Skip => {
                info!(%watermark, %now, "no new hours since watermark");
                return Ok(SyncOutcome::Skipped(SkipReason::EmptyWindow));
            }
        };

        let fetched = self.source.fetch_hours(&window, &self.org).await?;
        let observations = canonicalize(fetched)?;
        let metrics = flatten_all(&observations);

        let mut insert_calls = self.loader.load_observations(&observations).await?;
        insert_calls += self.loader.load_metrics(&metrics).await?;
        let purged_rows = self.sink.purge_expired(now - self.retention).await?;

        let report = SyncReport {
            window,
            observations: observations.len(),
            metric_rows: metrics.len(),
            insert_calls,
            purged_rows,
        };
        info!(
            %window,
            observations = report.observations,
            metric_rows = report.metric_rows,
            purged_rows,
            "incremental sync complete"
        );
        Ok(SyncOutcome::Synced(report))
    }
}

/// Register the controller on a cron job. Each tick is one trigger; the job id is the payload.
pub async fn build_scheduler(sync: Arc<IncrementalSync>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |job_id, _l| {
        let sync = sync.clone();
        Box::pin(async move {
            let trigger = Trigger {
                payload: job_id.as_bytes().to_vec(),
            };
            match sync.handle_trigger(trigger).await {
                Ok(outcome) => info!(?outcome, "scheduled sync finished"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run the scheduler until ctrl-c.
pub async fn run_scheduler_until_shutdown(sync: Arc<IncrementalSync>, cron: &str) -> anyhow::Result<()> {
    let mut sched = build_scheduler(sync, cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
