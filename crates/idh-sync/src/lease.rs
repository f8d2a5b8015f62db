//! Single-flight leases guarding the watermark read → append sequence.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idh_core::HarvestError;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(key: &str, holder: &str, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        Self {
            key: key.to_string(),
            holder: holder.to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Acquisition only succeeds when no unexpired lease exists for the key.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>, HarvestError>;

    /// Releasing a lease someone else now holds is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), HarvestError>;
}

/// In-process lease table, for a single scheduler process.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>, HarvestError> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|current| !current.is_expired()) {
            return Ok(None);
        }
        let lease = Lease::new(key, holder, ttl);
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<(), HarvestError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.key).is_some_and(|current| current.holder == lease.holder) {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}
