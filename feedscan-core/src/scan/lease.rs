//! Short-lived named leases on top of the table store.
//!
//! Acquiring inserts a row guarded by "must not exist"; an expired row may
//! be taken over with an etag-guarded replace. A lease that expired and was
//! taken over is simply lost by its previous holder.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::store::{TableStore, Versioned};

pub const LEASE_TABLE: &str = "leases";
const LEASE_PARTITION: &str = "leases";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Proof of a held lease, needed to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub name: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    etag: String,
}

#[derive(Clone)]
pub struct LeaseService {
    store: Arc<dyn TableStore>,
    duration: Duration,
}

impl fmt::Debug for LeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseService")
            .field("duration", &self.duration)
            .finish()
    }
}

/// Longest lease handed out; longer configured durations are clamped.
fn max_lease() -> Duration {
    Duration::days(365)
}

impl LeaseService {
    pub fn new(store: Arc<dyn TableStore>, duration: std::time::Duration) -> Self {
        Self {
            store,
            duration: Duration::from_std(duration)
                .unwrap_or_else(|_| max_lease())
                .min(max_lease()),
        }
    }

    /// `None` while someone else holds an unexpired lease of that name.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LeaseGuard>> {
        let owner = Uuid::new_v4().to_string();
        let record = LeaseRecord {
            owner: owner.clone(),
            expires_at: Utc::now() + self.duration,
        };
        let value = serde_json::to_value(&record)?;

        match self
            .store
            .insert(LEASE_TABLE, LEASE_PARTITION, name, value.clone())
            .await
        {
            Ok(etag) => return Ok(Some(self.guard(name, record, etag))),
            Err(ScanError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }

        let Some(row) = self.store.get(LEASE_TABLE, LEASE_PARTITION, name).await? else {
            // Released between our insert and read; let the caller retry.
            return Ok(None);
        };
        let current: Versioned<LeaseRecord> = Versioned::from_row(&row)?;
        if current.record.expires_at > Utc::now() {
            debug!(lease = %name, "lease is held elsewhere");
            return Ok(None);
        }

        match self
            .store
            .replace(LEASE_TABLE, LEASE_PARTITION, name, value, &current.etag)
            .await
        {
            Ok(etag) => {
                debug!(
                    lease = %name,
                    previous_owner = %current.record.owner,
                    "took over expired lease"
                );
                Ok(Some(self.guard(name, record, etag)))
            }
            Err(ScanError::VersionConflict { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Release a held lease. Losing it to a takeover is not an error.
    pub async fn release(&self, guard: LeaseGuard) -> Result<()> {
        match self
            .store
            .delete(LEASE_TABLE, LEASE_PARTITION, &guard.name, Some(&guard.etag))
            .await
        {
            Ok(_) => Ok(()),
            Err(ScanError::VersionConflict { .. }) => {
                debug!(lease = %guard.name, "lease was taken over before release");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn guard(&self, name: &str, record: LeaseRecord, etag: String) -> LeaseGuard {
        LeaseGuard {
            name: name.to_string(),
            owner: record.owner,
            expires_at: record.expires_at,
            etag,
        }
    }
}
