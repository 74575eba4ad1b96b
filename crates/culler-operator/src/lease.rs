//! Leader lease over the key-value store
//!
//! Single-writer election: a candidate takes the lease when it is empty,
//! already its own, or stale, and the holder refreshes it periodically. The
//! lease uses wall-clock comparison without fencing tokens; every mutation
//! downstream (detach, label apply, shutdown behavior) is idempotent at the
//! time scales involved, so a brief split-brain only risks performing the
//! same transition twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use culler_common::{Error, Result};

use crate::store::KeyValueStore;

const LEASE_KEY: &str = "leader";
const LEASE_EXPIRY_SECS: i64 = 60;
const ACQUIRE_RETRY: Duration = Duration::from_secs(10);
const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Persisted lease record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    leader: String,
    #[serde(rename = "lastLeaseTime", with = "rfc3339")]
    last_lease_time: DateTime<Utc>,
}

mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        t: &DateTime<Utc>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Leader lease held in the key-value store
pub struct LeaderLease {
    store: Arc<dyn KeyValueStore>,
    identity: String,
}

impl LeaderLease {
    /// Create a candidate with the given identity
    pub fn new(store: Arc<dyn KeyValueStore>, identity: impl Into<String>) -> Self {
        Self {
            store,
            identity: identity.into(),
        }
    }

    /// Block until the lease is held
    ///
    /// The controller performs no reconciliation before this returns.
    pub async fn acquire(&self) {
        info!(identity = %self.identity, "Waiting for leader lease...");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leader lease acquired");
                    return;
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Could not acquire leader lease");
                }
            }
            tokio::time::sleep(ACQUIRE_RETRY).await;
        }
    }

    /// Attempt to take or refresh the lease once
    pub async fn try_acquire(&self) -> Result<bool> {
        let record: Option<LeaseRecord> = match self.store.load(LEASE_KEY).await? {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                Error::serialization(format!("reading leader lease: {}", e))
            })?),
            None => None,
        };

        match record {
            None => {
                self.write_lease().await?;
                Ok(true)
            }
            Some(r) if r.leader.is_empty() || r.leader == self.identity => {
                self.write_lease().await?;
                Ok(true)
            }
            Some(r)
                if Utc::now() - r.last_lease_time
                    > chrono::Duration::seconds(LEASE_EXPIRY_SECS) =>
            {
                info!(previous = %r.leader, "Stale leader lease expired, taking over");
                self.write_lease().await?;
                Ok(true)
            }
            Some(r) => {
                debug!(leader = %r.leader, "Different leader still active");
                Ok(false)
            }
        }
    }

    /// Refresh the held lease until cancelled
    pub async fn manage(&self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {}
            }
            match self.try_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "Could not refresh leader lease, another leader is active");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Could not refresh leader lease");
                }
            }
        }
    }

    async fn write_lease(&self) -> Result<()> {
        let record = LeaseRecord {
            leader: self.identity.clone(),
            last_lease_time: Utc::now(),
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| Error::serialization(format!("writing leader lease: {}", e)))?;
        trace!(lease = %raw, "Writing leader lease");
        self.store.store(LEASE_KEY, Some(raw)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockKeyValueStore;

    fn record(leader: &str, age_secs: i64) -> String {
        serde_json::to_string(&LeaseRecord {
            leader: leader.to_string(),
            last_lease_time: Utc::now() - chrono::Duration::seconds(age_secs),
        })
        .unwrap()
    }

    #[test]
    fn test_lease_record_wire_format() {
        let raw = r#"{"leader":"node-a_42","lastLeaseTime":"2021-03-05T18:00:00Z"}"#;
        let parsed: LeaseRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.leader, "node-a_42");
        assert_eq!(serde_json::to_string(&parsed).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_acquires_empty_lease() {
        let mut store = MockKeyValueStore::new();
        store.expect_load().returning(|_| Ok(None));
        store
            .expect_store()
            .withf(|key, value| {
                key == "leader"
                    && value
                        .as_ref()
                        .is_some_and(|v| v.contains("\"leader\":\"me\""))
            })
            .returning(|_, _| Ok(()));

        let lease = LeaderLease::new(Arc::new(store), "me");
        assert!(lease.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_does_not_steal_fresh_lease() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_load()
            .returning(|_| Ok(Some(record("someone-else", 5))));
        store.expect_store().never();

        let lease = LeaderLease::new(Arc::new(store), "me");
        assert!(!lease.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_takes_over_stale_lease() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_load()
            .returning(|_| Ok(Some(record("crashed-holder", 120))));
        store.expect_store().returning(|_, _| Ok(()));

        let lease = LeaderLease::new(Arc::new(store), "me");
        assert!(lease.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_refreshes_own_lease() {
        let mut store = MockKeyValueStore::new();
        store.expect_load().returning(|_| Ok(Some(record("me", 30))));
        store.expect_store().times(1).returning(|_, _| Ok(()));

        let lease = LeaderLease::new(Arc::new(store), "me");
        assert!(lease.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_lease_is_an_error() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_load()
            .returning(|_| Ok(Some("not json".to_string())));

        let lease = LeaderLease::new(Arc::new(store), "me");
        assert!(lease.try_acquire().await.is_err());
    }
}
