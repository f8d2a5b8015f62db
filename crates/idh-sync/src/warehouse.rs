//! Warehouse sink contract, the Postgres implementation and the paced batch loader.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idh_core::{HarvestError, MetricRow, Observation, MEASUREMENT_COLUMNS};
use idh_storage::Pacer;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::config::HarvestConfig;
use crate::lease::{Lease, LeaseStore};
use crate::reconcile::partition;

/// The system of record. Backfill recreates tables; incremental runs only append.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Drop and recreate both tables. Destructive.
    async fn recreate_tables(&self) -> Result<(), HarvestError>;

    async fn insert_observations(&self, rows: &[Observation]) -> Result<(), HarvestError>;

    async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<(), HarvestError>;

    /// Latest timestamp in the metrics table, `None` before the first write.
    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, HarvestError>;

    /// Delete rows older than `before` from both tables, returning the number removed.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, HarvestError>;
}

fn sink_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> HarvestError {
    move |err| HarvestError::transport(context, err)
}

#[derive(Debug, Clone)]
pub struct TableNames {
    pub dataset: String,
    pub observations: String,
    pub metrics: String,
}

impl TableNames {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            dataset: config.dataset.clone(),
            observations: config.observations_table.clone(),
            metrics: config.metrics_table.clone(),
        }
    }

    fn observations(&self) -> String {
        format!("{}.{}", self.dataset, self.observations)
    }

    fn metrics(&self) -> String {
        format!("{}.{}", self.dataset, self.metrics)
    }

    fn leases(&self) -> String {
        format!("{}.sync_leases", self.dataset)
    }
}

/// Postgres-backed warehouse. Table names come from a validated [`HarvestConfig`], so they are
/// interpolated as plain identifiers.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    tables: TableNames,
}

impl PgWarehouse {
    pub async fn connect(config: &HarvestConfig) -> Result<Self, HarvestError> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(config.http_timeout_secs.max(1)))
            .connect(&config.database_url)
            .await
            .map_err(sink_error("connecting to warehouse"))?;
        let warehouse = Self {
            pool,
            tables: TableNames::from_config(config),
        };
        warehouse.ensure_lease_table().await?;
        Ok(warehouse)
    }

    async fn ensure_lease_table(&self) -> Result<(), HarvestError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.tables.dataset))
            .execute(&self.pool)
            .await
            .map_err(sink_error("creating dataset schema"))?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                lease_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )",
            self.tables.leases()
        ))
        .execute(&self.pool)
        .await
        .map_err(sink_error("creating lease table"))?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn recreate_tables(&self) -> Result<(), HarvestError> {
        let observations = self.tables.observations();
        let metrics = self.tables.metrics();
        let measurement_columns = MEASUREMENT_COLUMNS
            .iter()
            .map(|c| format!("{c} BIGINT NOT NULL"))
            .collect::<Vec<_>>()
            .join(",\n                ");

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.tables.dataset),
            format!("DROP TABLE IF EXISTS {observations}"),
            format!(
                "CREATE TABLE {observations} (
                \"timestamp\" TIMESTAMPTZ NOT NULL,
                {measurement_columns},
                \"sum\" BIGINT NOT NULL
            )"
            ),
            format!(
                "CREATE INDEX {}_timestamp_idx ON {observations} (\"timestamp\")",
                self.tables.observations
            ),
            format!("DROP TABLE IF EXISTS {metrics}"),
            format!(
                "CREATE TABLE {metrics} (
                \"timestamp\" TIMESTAMPTZ NOT NULL,
                method TEXT NOT NULL,
                \"count\" BIGINT NOT NULL
            )"
            ),
            format!(
                "CREATE INDEX {}_timestamp_idx ON {metrics} (\"timestamp\")",
                self.tables.metrics
            ),
        ];

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(sink_error("starting table recreation"))?;
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(sink_error("recreating warehouse tables"))?;
        }
        tx.commit()
            .await
            .map_err(sink_error("committing table recreation"))?;
        info!(%observations, %metrics, "warehouse tables recreated");
        Ok(())
    }

    async fn insert_observations(&self, rows: &[Observation]) -> Result<(), HarvestError> {
        if rows.is_empty() {
            return Ok(());
        }
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
        let mut columns: Vec<Vec<i64>> = vec![Vec::with_capacity(rows.len()); MEASUREMENT_COLUMNS.len()];
        for row in rows {
            for (column, value) in columns.iter_mut().zip(row.measurements.column_values()) {
                column.push(i64::from(value));
            }
        }
        let sums: Vec<i64> = rows
            .iter()
            .map(|r| r.sum.unwrap_or_else(|| r.measurements.method_sum()))
            .collect();

        let column_list = MEASUREMENT_COLUMNS.join(", ");
        let casts = (2..=MEASUREMENT_COLUMNS.len() + 1)
            .map(|i| format!("${i}::BIGINT[]"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} (\"timestamp\", {column_list}, \"sum\")
             SELECT * FROM UNNEST($1::TIMESTAMPTZ[], {casts}, ${}::BIGINT[])",
            self.tables.observations(),
            MEASUREMENT_COLUMNS.len() + 2
        );

        let mut query = sqlx::query(&sql).bind(timestamps);
        for column in columns {
            query = query.bind(column);
        }
        query
            .bind(sums)
            .execute(&self.pool)
            .await
            .map_err(sink_error("inserting observations"))?;
        debug!(rows = rows.len(), "observations inserted");
        Ok(())
    }

    async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<(), HarvestError> {
        if rows.is_empty() {
            return Ok(());
        }
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
        let methods: Vec<String> = rows.iter().map(|r| r.method.as_str().to_string()).collect();
        let counts: Vec<i64> = rows.iter().map(|r| i64::from(r.count)).collect();

        sqlx::query(&format!(
            "INSERT INTO {} (\"timestamp\", method, \"count\")
             SELECT * FROM UNNEST($1::TIMESTAMPTZ[], $2::TEXT[], $3::BIGINT[])",
            self.tables.metrics()
        ))
        .bind(timestamps)
        .bind(methods)
        .bind(counts)
        .execute(&self.pool)
        .await
        .map_err(sink_error("inserting metric rows"))?;
        debug!(rows = rows.len(), "metric rows inserted");
        Ok(())
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, HarvestError> {
        let result = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(&format!(
            "SELECT MAX(\"timestamp\") FROM {}",
            self.tables.metrics()
        ))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(watermark) => Ok(watermark),
            // undefined_table: nothing has ever been written
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P01") => Ok(None),
            Err(err) => Err(HarvestError::transport("reading watermark", err)),
        }
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, HarvestError> {
        let mut purged = 0;
        for table in [self.tables.observations(), self.tables.metrics()] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE \"timestamp\" < $1"))
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(sink_error("purging expired rows"))?;
            purged += result.rows_affected();
        }
        Ok(purged)
    }
}

#[async_trait]
impl LeaseStore for PgWarehouse {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>, HarvestError> {
        let lease = Lease::new(key, holder, ttl);
        let acquired = sqlx::query_scalar::<_, String>(&format!(
            "INSERT INTO {} AS l (lease_key, holder, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (lease_key) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE l.expires_at < now()
             RETURNING holder",
            self.tables.leases()
        ))
        .bind(&lease.key)
        .bind(&lease.holder)
        .bind(lease.expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(sink_error("acquiring sync lease"))?;
        Ok(acquired.map(|_| lease))
    }

    async fn release(&self, lease: &Lease) -> Result<(), HarvestError> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE lease_key = $1 AND holder = $2",
            self.tables.leases()
        ))
        .bind(&lease.key)
        .bind(&lease.holder)
        .execute(&self.pool)
        .await
        .map_err(sink_error("releasing sync lease"))?;
        Ok(())
    }
}

/// Feeds rows to the warehouse one bounded batch per call, pausing between calls.
pub struct BatchLoader {
    sink: Arc<dyn Warehouse>,
    limit: NonZeroUsize,
    pacer: Pacer,
}

impl BatchLoader {
    pub fn new(sink: Arc<dyn Warehouse>, limit: NonZeroUsize, min_interval: Duration) -> Self {
        Self {
            sink,
            limit,
            pacer: Pacer::new(min_interval),
        }
    }

    /// Returns the number of insert calls issued.
    pub async fn load_observations(&self, rows: &[Observation]) -> Result<usize, HarvestError> {
        let batches = partition(rows, self.limit);
        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            self.pacer.wait().await;
            self.sink.insert_observations(batch).await?;
            debug!(batch = index + 1, total, rows = batch.len(), "observation batch loaded");
        }
        Ok(total)
    }

    pub async fn load_metrics(&self, rows: &[MetricRow]) -> Result<usize, HarvestError> {
        let batches = partition(rows, self.limit);
        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            self.pacer.wait().await;
            self.sink.insert_metrics(batch).await?;
            debug!(batch = index + 1, total, rows = batch.len(), "metric batch loaded");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hourly, MemoryWarehouse};
    use crate::reconcile::flatten_all;

    #[tokio::test]
    async fn loader_issues_one_call_per_batch() {
        let sink = Arc::new(MemoryWarehouse::default());
        let loader = BatchLoader::new(sink.clone(), NonZeroUsize::new(4).unwrap(), Duration::ZERO);
        let observations = hourly(0..10, |_| 1);

        assert_eq!(loader.load_observations(&observations).await.unwrap(), 3);
        assert_eq!(loader.load_metrics(&flatten_all(&observations)).await.unwrap(), 25);
        assert_eq!(sink.observation_batches(), vec![4, 4, 2]);
        assert_eq!(sink.observations().len(), 10);
        assert_eq!(sink.metrics().len(), 100);
    }

    #[tokio::test]
    async fn empty_input_never_calls_the_sink() {
        let sink = Arc::new(MemoryWarehouse::default());
        let loader = BatchLoader::new(sink.clone(), NonZeroUsize::new(4).unwrap(), Duration::ZERO);
        assert_eq!(loader.load_observations(&[]).await.unwrap(), 0);
        assert!(sink.observation_batches().is_empty());
    }

    #[test]
    fn qualified_names_use_the_dataset_schema() {
        let tables = TableNames::from_config(&HarvestConfig::default());
        assert_eq!(tables.observations(), "idporten.logins");
        assert_eq!(tables.metrics(), "idporten.login_metrics");
        assert_eq!(tables.leases(), "idporten.sync_leases");
    }
}
