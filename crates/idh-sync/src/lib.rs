//! Harvest pipeline: reconciliation, warehouse loading, backfill and the incremental controller.

pub mod backfill;
pub mod config;
pub mod export;
pub mod incremental;
pub mod lease;
pub mod reconcile;
pub mod warehouse;

pub use backfill::{Backfill, BackfillSummary};
pub use config::HarvestConfig;
pub use export::{export_snapshot, SnapshotManifest};
pub use incremental::{
    build_scheduler, compute_window, run_scheduler_until_shutdown, IncrementalSync, SkipReason,
    SyncOutcome, SyncReport, SyncState, Trigger, WindowDecision,
};
pub use lease::{Lease, LeaseStore, MemoryLeaseStore};
pub use reconcile::{canonicalize, flatten, flatten_all, partition, reconcile};
pub use warehouse::{BatchLoader, PgWarehouse, TableNames, Warehouse};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::ops::Range;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use idh_adapters::StatisticsSource;
    use idh_core::{HarvestError, Measurements, MetricRow, Observation, OrgId, TimeRange};

    use crate::config::HarvestConfig;
    use crate::reconcile::flatten;
    use crate::warehouse::Warehouse;

    pub fn at_hour(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).single().unwrap() + Duration::hours(hour)
    }

    /// One observation per hour with `bankid` from `bankid(hour)`, one MinID login and two
    /// federated ones, so `antall` stays consistent with the method sum.
    pub fn hourly(hours: Range<i64>, bankid: impl Fn(i64) -> u32) -> Vec<Observation> {
        hours
            .map(|hour| {
                let bankid = bankid(hour);
                let measurements = Measurements {
                    bankid,
                    minid: 1,
                    federated: 2,
                    antall: bankid + 3,
                    ..Default::default()
                };
                Observation::new(at_hour(hour), measurements)
            })
            .collect()
    }

    pub fn test_config() -> HarvestConfig {
        HarvestConfig {
            historical_org: OrgId::new("111111111"),
            current_org: OrgId::new("222222222"),
            batch_size: 100,
            backfill_step_days: 1,
            source_delay_ms: 0,
            sink_delay_ms: 0,
            ..HarvestConfig::default()
        }
    }

    /// In-memory source keyed by account. Returns the rows inside the requested window.
    #[derive(Default)]
    pub struct FakeSource {
        rows: HashMap<OrgId, Vec<Observation>>,
        failing: bool,
        calls: Mutex<Vec<(TimeRange, OrgId)>>,
    }

    impl FakeSource {
        pub fn with_rows(mut self, org: &OrgId, rows: Vec<Observation>) -> Self {
            self.rows.entry(org.clone()).or_default().extend(rows);
            self
        }

        pub fn failing(mut self) -> Self {
            self.failing = true;
            self
        }

        pub fn calls(&self) -> Vec<(TimeRange, OrgId)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatisticsSource for FakeSource {
        async fn fetch_hours(&self, range: &TimeRange, org: &OrgId) -> Result<Vec<Observation>, HarvestError> {
            self.calls.lock().unwrap().push((*range, org.clone()));
            if self.failing {
                return Err(HarvestError::Transport {
                    context: "statistics source unavailable".to_string(),
                    status: Some(503),
                    source: None,
                });
            }
            Ok(self
                .rows
                .get(org)
                .map(|rows| {
                    rows.iter()
                        .filter(|o| o.timestamp >= range.from && o.timestamp < range.to)
                        .cloned()
                        .map(|o| o.with_source_org(org.clone()))
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct Tables {
        recreated: usize,
        observations: Vec<Observation>,
        metrics: Vec<MetricRow>,
        observation_batches: Vec<usize>,
        metric_batches: Vec<usize>,
        failing_inserts: bool,
        failing_watermark: bool,
    }

    fn sink_unavailable(what: &str) -> HarvestError {
        HarvestError::Transport {
            context: format!("warehouse rejected {what}"),
            status: None,
            source: None,
        }
    }

    #[derive(Default)]
    pub struct MemoryWarehouse {
        tables: Mutex<Tables>,
    }

    impl MemoryWarehouse {
        /// Seed the metrics table with one hour so the watermark reads `at`.
        pub fn with_watermark(self, at: DateTime<Utc>) -> Self {
            let seed = Observation::new(at, Measurements { minid: 1, antall: 1, ..Default::default() });
            self.tables.lock().unwrap().metrics.extend(flatten(&seed));
            self
        }

        /// Every insert call fails; nothing is written.
        pub fn failing_inserts(self) -> Self {
            self.tables.lock().unwrap().failing_inserts = true;
            self
        }

        pub fn failing_watermark(self) -> Self {
            self.tables.lock().unwrap().failing_watermark = true;
            self
        }

        pub fn recreated(&self) -> usize {
            self.tables.lock().unwrap().recreated
        }

        pub fn observations(&self) -> Vec<Observation> {
            self.tables.lock().unwrap().observations.clone()
        }

        pub fn metrics(&self) -> Vec<MetricRow> {
            self.tables.lock().unwrap().metrics.clone()
        }

        pub fn observation_batches(&self) -> Vec<usize> {
            self.tables.lock().unwrap().observation_batches.clone()
        }

        pub fn metric_batches(&self) -> Vec<usize> {
            self.tables.lock().unwrap().metric_batches.clone()
        }

        pub fn watermark_now(&self) -> Option<DateTime<Utc>> {
            self.tables.lock().unwrap().metrics.iter().map(|m| m.timestamp).max()
        }
    }

    #[async_trait]
    impl Warehouse for MemoryWarehouse {
        async fn recreate_tables(&self) -> Result<(), HarvestError> {
            let mut tables = self.tables.lock().unwrap();
            tables.recreated += 1;
            tables.observations.clear();
            tables.metrics.clear();
            Ok(())
        }

        async fn insert_observations(&self, rows: &[Observation]) -> Result<(), HarvestError> {
            let mut tables = self.tables.lock().unwrap();
            if tables.failing_inserts {
                return Err(sink_unavailable("observation insert"));
            }
            tables.observation_batches.push(rows.len());
            tables.observations.extend_from_slice(rows);
            Ok(())
        }

        async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<(), HarvestError> {
            let mut tables = self.tables.lock().unwrap();
            if tables.failing_inserts {
                return Err(sink_unavailable("metric insert"));
            }
            tables.metric_batches.push(rows.len());
            tables.metrics.extend_from_slice(rows);
            Ok(())
        }

        async fn watermark(&self) -> Result<Option<DateTime<Utc>>, HarvestError> {
            if self.tables.lock().unwrap().failing_watermark {
                return Err(sink_unavailable("watermark query"));
            }
            Ok(self.watermark_now())
        }

        async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, HarvestError> {
            let mut tables = self.tables.lock().unwrap();
            let rows_before = tables.observations.len() + tables.metrics.len();
            tables.observations.retain(|o| o.timestamp >= before);
            tables.metrics.retain(|m| m.timestamp >= before);
            Ok((rows_before - tables.observations.len() - tables.metrics.len()) as u64)
        }
    }
}
