//! HTTP fetch plumbing, call pacing and the raw payload archive.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use idh_core::HarvestError;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub sha256: String,
    /// Relative to the archive root.
    pub path: PathBuf,
    pub bytes: usize,
    pub already_present: bool,
}

/// Immutable, hash-addressed store for raw source payloads.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<org>/<window start>/<sha256>.json`
    pub fn payload_path(window_start: DateTime<Utc>, org: &str, sha256: &str) -> PathBuf {
        [
            org.to_string(),
            window_start.format("%Y%m%d_%H%M%S").to_string(),
            format!("{sha256}.json"),
        ]
        .iter()
        .collect()
    }

    /// Identical payloads for the same window map to the same file, which is never rewritten.
    /// New files appear through a temp file and a rename, so readers never see a partial write.
    pub async fn store(
        &self,
        window_start: DateTime<Utc>,
        org: &str,
        payload: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let sha256 = Self::sha256_hex(payload);
        let path = Self::payload_path(window_start, org, &sha256);
        let target = self.root.join(&path);
        let mut archived = ArchivedPayload {
            sha256,
            path,
            bytes: payload.len(),
            already_present: true,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("probing {}", target.display()))?
        {
            return Ok(archived);
        }

        let dir = target.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::File::create(&staging)
            .await
            .with_context(|| format!("creating {}", staging.display()))?;
        file.write_all(payload)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", staging.display()))?;
        drop(file);

        let renamed = fs::rename(&staging, &target).await;
        if renamed.is_err() {
            fs::remove_file(&staging).await.ok();
        }
        renamed.with_context(|| format!("publishing archived payload {}", target.display()))?;
        archived.already_present = false;
        debug!(path = %archived.path.display(), bytes = archived.bytes, "payload archived");
        Ok(archived)
    }
}

/// Enforces a minimum delay between consecutive calls. Callers are serialized while waiting.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let pause = self.min_interval - elapsed;
                debug!(pause_ms = pause.as_millis() as u64, "pacing outbound call");
                tokio::time::sleep(pause).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            min_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl From<FetchError> for HarvestError {
    fn from(err: FetchError) -> Self {
        let status = match &err {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(inner) => inner.status().map(|s| s.as_u16()),
        };
        HarvestError::Transport {
            context: err.to_string(),
            status,
            source: Some(Box::new(err)),
        }
    }
}

/// Single-shot GET client. Retries are the caller's business; the next scheduled run covers
/// a failed window again.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Pacer,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer: Pacer::new(config.min_interval),
        })
    }

    pub async fn fetch_bytes(&self, label: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.pacer.wait().await;

        let span = info_span!("http_fetch", label, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn payload_hashing_is_stable() {
        let hash = PayloadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_are_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let window_start = Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).single().expect("ts");

        let first = archive
            .store(window_start, "889640782", b"[]")
            .await
            .expect("first store");
        let second = archive
            .store(window_start, "889640782", b"[]")
            .await
            .expect("second store");

        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(first.path, second.path);
        assert_eq!(
            first.path,
            PathBuf::from("889640782/20200501_000000").join(format!("{}.json", first.sha256))
        );
        assert!(dir.path().join(&first.path).is_file());

        let other = archive
            .store(window_start, "889640782", b"[{}]")
            .await
            .expect("third store");
        assert!(!other.already_present);
        assert_ne!(other.path, first.path);
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = Pacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.wait().await;
        pacer.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn http_status_maps_to_transport_error() {
        let err: HarvestError = FetchError::HttpStatus {
            status: 503,
            url: "https://example.invalid/hours".into(),
        }
        .into();
        match err {
            HarvestError::Transport { status, .. } => assert_eq!(status, Some(503)),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
