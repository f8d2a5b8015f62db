//! Statistics source contract + the HTTP adapter for the hourly login statistics API.

use async_trait::async_trait;
use idh_core::{format_instant, parse_instant, HarvestError, Measurements, Observation, OrgId, TimeRange};
use idh_storage::{HttpFetcher, PayloadArchive};
use serde::Deserialize;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://statistikk-utdata.difi.no";
pub const DEFAULT_SOURCE_PATH: &str = "991825827/idporten-innlogging/hours";
pub const ORG_CATEGORY: &str = "TE-orgnum";

/// Anything that can report hourly observations for one organization identifier.
///
/// Implementations return rows in source order for every hour with data inside the half-open
/// range. Gaps are not errors.
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    async fn fetch_hours(&self, range: &TimeRange, org: &OrgId) -> Result<Vec<Observation>, HarvestError>;
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    timestamp: String,
    #[serde(default)]
    measurements: Measurements,
    #[serde(default)]
    categories: WireCategories,
}

#[derive(Debug, Default, Deserialize)]
struct WireCategories {
    #[serde(rename = "TE-orgnum")]
    te_orgnum: Option<String>,
}

/// Decode a JSON array payload into observations tagged with their reporting organization.
pub fn parse_payload(bytes: &[u8]) -> Result<Vec<Observation>, HarvestError> {
    let wire: Vec<WireObservation> = serde_json::from_slice(bytes)
        .map_err(|err| HarvestError::parse("decoding statistics payload", err))?;

    wire.into_iter()
        .map(|row| {
            let timestamp = parse_instant(&row.timestamp)?;
            let observation = Observation::new(timestamp, row.measurements);
            Ok(match row.categories.te_orgnum {
                Some(org) => observation.with_source_org(OrgId::new(org)),
                None => observation,
            })
        })
        .collect()
}

/// The source treats `to` as inclusive; trim to the half-open window so adjacent windows
/// never report the same hour twice.
pub fn retain_in_range(observations: &mut Vec<Observation>, range: &TimeRange) {
    let before = observations.len();
    observations.retain(|o| o.timestamp >= range.from && o.timestamp < range.to);
    let dropped = before - observations.len();
    if dropped > 0 {
        debug!(dropped, %range, "dropped rows outside requested window");
    }
}

pub fn hours_query_url(base_url: &str, source_path: &str, range: &TimeRange, org: &OrgId) -> String {
    format!(
        "{}/{}?from={}&to={}&categories={}={}",
        base_url.trim_end_matches('/'),
        source_path.trim_matches('/'),
        format_instant(&range.from),
        format_instant(&range.to),
        ORG_CATEGORY,
        org
    )
}

pub struct StatisticsClient {
    http: HttpFetcher,
    base_url: String,
    source_path: String,
    archive: Option<PayloadArchive>,
}

impl StatisticsClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            source_path: source_path.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn hours_url(&self, range: &TimeRange, org: &OrgId) -> String {
        hours_query_url(&self.base_url, &self.source_path, range, org)
    }
}

#[async_trait]
impl StatisticsSource for StatisticsClient {
    async fn fetch_hours(&self, range: &TimeRange, org: &OrgId) -> Result<Vec<Observation>, HarvestError> {
        let url = self.hours_url(range, org);
        let response = self.http.fetch_bytes(org.as_str(), &url).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store(range.from, org.as_str(), &response.body).await {
                warn!(error = %err, %org, %range, "failed to archive raw payload");
            }
        }

        let mut observations = parse_payload(&response.body)?;
        retain_in_range(&mut observations, range);
        debug!(rows = observations.len(), %org, %range, "parsed statistics payload");
        Ok(observations)
    }
}
