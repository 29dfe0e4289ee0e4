//! Durable run progress: checkpoint, work list snapshot and run lease.
//!
//! All state lives in the object store under `{collection}/...` keys. A
//! save is one put of the whole serialized checkpoint, so a reader sees
//! either the previous or the new value.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::model::{Checkpoint, WorkList};
use crate::ratelimit::{retry_with_backoff, BackoffPolicy};
use crate::store::ObjectStore;

/// Object keys for one collection
pub mod keys {
    pub fn checkpoint(collection: &str) -> String {
        format!("{}/checkpoint", collection)
    }

    pub fn work_list(collection: &str) -> String {
        format!("{}/worklist", collection)
    }

    pub fn lease(collection: &str) -> String {
        format!("{}/lease", collection)
    }

    pub fn results_prefix(collection: &str) -> String {
        format!("{}/results/", collection)
    }

    pub fn results_index(collection: &str) -> String {
        format!("{}/results/index", collection)
    }

    pub fn result_record(collection: &str, id: &str) -> String {
        format!("{}/results/records/{}", collection, id)
    }
}

/// Retry budget for store writes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersistPolicy {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: BackoffPolicy {
                base: std::time::Duration::from_millis(250),
                factor: 2.0,
                cap: std::time::Duration::from_secs(5),
                jitter: 0.2,
            },
        }
    }
}

/// Put with bounded retries; exhaustion is fatal for the run
pub(crate) async fn put_with_retry(
    store: &dyn ObjectStore,
    policy: &PersistPolicy,
    key: &str,
    value: &[u8],
) -> Result<(), PipelineError> {
    retry_with_backoff(&policy.backoff, policy.attempts, || async {
        store.put_object(key, value)
    })
    .await
    .map_err(|e| PipelineError::persistence(key, policy.attempts, format!("{:#}", e)))
}

fn read_json<T: for<'de> Deserialize<'de>>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<T>, PipelineError> {
    let Some(bytes) = store
        .get_object(key)
        .map_err(|e| PipelineError::persistence(key, 1, format!("{:#}", e)))?
    else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipelineError::corrupt(key, e))
}

/// Exclusive claim on a collection for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    collection: String,
    policy: PersistPolicy,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, collection: &str, policy: PersistPolicy) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            policy,
        }
    }

    pub fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        read_json(self.store.as_ref(), &keys::checkpoint(&self.collection))
    }

    /// Persist the checkpoint; on failure the stored value is unchanged
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let key = keys::checkpoint(&self.collection);
        let bytes = serde_json::to_vec(checkpoint).map_err(|e| PipelineError::corrupt(&key, e))?;
        put_with_retry(self.store.as_ref(), &self.policy, &key, &bytes).await?;
        debug!(
            collection = %self.collection,
            cursor = checkpoint.cursor,
            completed = checkpoint.completed_ids.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load_work_list(&self) -> Result<Option<WorkList>, PipelineError> {
        read_json(self.store.as_ref(), &keys::work_list(&self.collection))
    }

    pub async fn save_work_list(&self, work_list: &WorkList) -> Result<(), PipelineError> {
        let key = keys::work_list(&self.collection);
        let bytes = serde_json::to_vec(work_list).map_err(|e| PipelineError::corrupt(&key, e))?;
        put_with_retry(self.store.as_ref(), &self.policy, &key, &bytes).await
    }

    /// Operator reset: drop progress and the snapshot, optionally results.
    /// Returns the number of objects removed.
    pub fn reset(&self, include_results: bool) -> anyhow::Result<usize> {
        let mut removed = 0;
        for key in [keys::checkpoint(&self.collection), keys::work_list(&self.collection)] {
            if self.store.delete_object(&key)? {
                removed += 1;
            }
        }
        if include_results {
            for key in self.store.list_keys(&keys::results_prefix(&self.collection))? {
                if self.store.delete_object(&key)? {
                    removed += 1;
                }
            }
        }
        info!(collection = %self.collection, removed, include_results, "collection reset");
        Ok(removed)
    }

    // === Lease ===

    pub fn current_lease(&self) -> Result<Option<Lease>, PipelineError> {
        read_json(self.store.as_ref(), &keys::lease(&self.collection))
    }

    /// Claim the collection. Expired leases and our own lease are taken over.
    pub fn acquire_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, PipelineError> {
        let key = keys::lease(&self.collection);
        let lease = Lease {
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        let new_bytes = serde_json::to_vec(&lease).map_err(|e| PipelineError::corrupt(&key, e))?;

        // A lost race re-reads and decides again
        for _ in 0..3 {
            let current = self
                .store
                .get_object(&key)
                .map_err(|e| PipelineError::persistence(&key, 1, format!("{:#}", e)))?;

            if let Some(bytes) = &current {
                match serde_json::from_slice::<Lease>(bytes) {
                    Ok(existing) if existing.holder != holder && !existing.is_expired(now) => {
                        return Err(PipelineError::AlreadyRunning {
                            collection: self.collection.clone(),
                            holder: existing.holder,
                            expires_at: existing.expires_at,
                        });
                    }
                    Ok(existing) if existing.holder != holder => {
                        warn!(collection = %self.collection, previous = %existing.holder, "taking over expired lease");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(collection = %self.collection, error = %e, "replacing unreadable lease");
                    }
                }
            }

            let swapped = self
                .store
                .compare_and_swap(&key, current.as_deref(), &new_bytes)
                .map_err(|e| PipelineError::persistence(&key, 1, format!("{:#}", e)))?;
            if swapped {
                debug!(collection = %self.collection, holder, "lease acquired");
                return Ok(lease);
            }
        }

        Err(PipelineError::persistence(&key, 3, "lease contended"))
    }

    /// Extend our lease. Fails if someone else took it over.
    pub fn renew_lease(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, PipelineError> {
        let key = keys::lease(&self.collection);
        let current = self
            .store
            .get_object(&key)
            .map_err(|e| PipelineError::persistence(&key, 1, format!("{:#}", e)))?;

        let held_by_us = current
            .as_deref()
            .and_then(|b| serde_json::from_slice::<Lease>(b).ok())
            .map(|l| l.holder == lease.holder)
            .unwrap_or(false);

        if !held_by_us {
            let existing = self.current_lease()?;
            return Err(PipelineError::AlreadyRunning {
                collection: self.collection.clone(),
                holder: existing
                    .as_ref()
                    .map(|l| l.holder.clone())
                    .unwrap_or_else(|| "nobody".to_string()),
                expires_at: existing.map(|l| l.expires_at).unwrap_or(now),
            });
        }

        let renewed = Lease {
            holder: lease.holder.clone(),
            acquired_at: lease.acquired_at,
            expires_at: now + ttl,
        };
        let bytes = serde_json::to_vec(&renewed).map_err(|e| PipelineError::corrupt(&key, e))?;
        if !self
            .store
            .compare_and_swap(&key, current.as_deref(), &bytes)
            .map_err(|e| PipelineError::persistence(&key, 1, format!("{:#}", e)))?
        {
            return Err(PipelineError::persistence(&key, 1, "lease changed during renewal"));
        }
        Ok(renewed)
    }

    /// Drop our lease if we still hold it
    pub fn release_lease(&self, holder: &str) -> anyhow::Result<()> {
        let key = keys::lease(&self.collection);
        if let Some(bytes) = self.store.get_object(&key)? {
            let ours = serde_json::from_slice::<Lease>(&bytes)
                .map(|l| l.holder == holder)
                .unwrap_or(false);
            if ours {
                self.store.delete_object(&key)?;
                debug!(collection = %self.collection, holder, "lease released");
            }
        }
        Ok(())
    }
}
