//! One-time destructive history load reconciling both organization accounts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use idh_adapters::StatisticsSource;
use idh_core::{HarvestError, Observation, OrgId, TimeRange};
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::config::HarvestConfig;
use crate::reconcile::{flatten_all, reconcile};
use crate::warehouse::{BatchLoader, Warehouse};

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub range: TimeRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub historical_rows: usize,
    pub current_rows: usize,
    pub observations: usize,
    pub metric_rows: usize,
    pub insert_calls: usize,
}

pub struct Backfill {
    source: Arc<dyn StatisticsSource>,
    sink: Arc<dyn Warehouse>,
    loader: BatchLoader,
    historical_org: OrgId,
    current_org: OrgId,
    step: Duration,
}

struct Collected {
    historical_rows: usize,
    current_rows: usize,
    canonical: Vec<Observation>,
}

impl Backfill {
    pub fn new(
        config: &HarvestConfig,
        source: Arc<dyn StatisticsSource>,
        sink: Arc<dyn Warehouse>,
    ) -> Result<Self, HarvestError> {
        config.validate()?;
        if config.historical_org.is_empty() {
            return Err(HarvestError::Configuration(
                "historical_org must be set for a backfill".to_string(),
            ));
        }
        Ok(Self {
            loader: BatchLoader::new(sink.clone(), config.batch_limit()?, config.sink_delay()),
            source,
            sink,
            historical_org: config.historical_org.clone(),
            current_org: config.current_org.clone(),
            step: config.backfill_step(),
        })
    }

    /// Fetch one account window by window. The source client paces the calls.
    async fn fetch_org(&self, range: &TimeRange, org: &OrgId) -> Result<Vec<Observation>, HarvestError> {
        let mut rows = Vec::new();
        for window in range.split(self.step) {
            let fetched = self.source.fetch_hours(&window, org).await?;
            rows.extend(fetched);
        }
        info!(%org, rows = rows.len(), "account history fetched");
        Ok(rows)
    }

    async fn collect_inner(&self, range: &TimeRange) -> Result<Collected, HarvestError> {
        let primary = self.fetch_org(range, &self.historical_org).await?;
        let secondary = self.fetch_org(range, &self.current_org).await?;
        let (historical_rows, current_rows) = (primary.len(), secondary.len());
        let canonical = reconcile(primary, secondary)?;
        Ok(Collected {
            historical_rows,
            current_rows,
            canonical,
        })
    }

    /// Fetch and reconcile without touching the warehouse.
    pub async fn collect(&self, range: &TimeRange) -> Result<Vec<Observation>, HarvestError> {
        let span = info_span!("backfill_collect", %range);
        Ok(self.collect_inner(range).instrument(span).await?.canonical)
    }

    /// Collect, recreate the tables, then load everything. Any failure aborts the run.
    pub async fn run(&self, range: &TimeRange) -> Result<BackfillSummary, HarvestError> {
        let span = info_span!("backfill", %range);
        async {
            let started_at = Utc::now();
            let collected = self.collect_inner(range).await?;
            let metrics = flatten_all(&collected.canonical);

            self.sink.recreate_tables().await?;
            let mut insert_calls = self.loader.load_observations(&collected.canonical).await?;
            insert_calls += self.loader.load_metrics(&metrics).await?;

            let summary = BackfillSummary {
                range: *range,
                started_at,
                finished_at: Utc::now(),
                historical_rows: collected.historical_rows,
                current_rows: collected.current_rows,
                observations: collected.canonical.len(),
                metric_rows: metrics.len(),
                insert_calls,
            };
            info!(
                observations = summary.observations,
                metric_rows = summary.metric_rows,
                insert_calls,
                "backfill complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}
