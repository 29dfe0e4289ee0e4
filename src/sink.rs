//! Result sink: one classification record per repository id.
//!
//! Each record lives under its own key, so re-emitting an id replaces it in
//! place. A separate index keeps first-seen order for exports and is only
//! written after the records it names.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::checkpoint::{keys, put_with_retry, PersistPolicy};
use crate::error::PipelineError;
use crate::model::ClassificationRecord;
use crate::store::ObjectStore;

pub struct ResultSink {
    store: Arc<dyn ObjectStore>,
    collection: String,
    policy: PersistPolicy,
}

impl ResultSink {
    pub fn new(store: Arc<dyn ObjectStore>, collection: &str, policy: PersistPolicy) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            policy,
        }
    }

    /// Insert or replace records by id
    pub async fn upsert(&self, records: &[ClassificationRecord]) -> Result<(), PipelineError> {
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            let key = keys::result_record(&self.collection, &record.id);
            let bytes = serde_json::to_vec(record).map_err(|e| PipelineError::corrupt(&key, e))?;
            put_with_retry(self.store.as_ref(), &self.policy, &key, &bytes).await?;
        }

        let mut index = self.index()?;
        let known: HashSet<&str> = index.iter().map(String::as_str).collect();
        let fresh: Vec<String> = records
            .iter()
            .filter(|r| !known.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();

        if !fresh.is_empty() {
            index.extend(fresh);
            let key = keys::results_index(&self.collection);
            let bytes = serde_json::to_vec(&index).map_err(|e| PipelineError::corrupt(&key, e))?;
            put_with_retry(self.store.as_ref(), &self.policy, &key, &bytes).await?;
        }

        debug!(collection = %self.collection, written = records.len(), total = index.len(), "results upserted");
        Ok(())
    }

    /// Ids in first-seen order
    pub fn index(&self) -> Result<Vec<String>, PipelineError> {
        let key = keys::results_index(&self.collection);
        match self
            .store
            .get_object(&key)
            .map_err(|e| PipelineError::persistence(&key, 1, format!("{:#}", e)))?
        {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| PipelineError::corrupt(&key, e)),
            None => Ok(Vec::new()),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<ClassificationRecord>, PipelineError> {
        let key = keys::result_record(&self.collection, id);
        let Some(bytes) = self
            .store
            .get_object(&key)
            .map_err(|e| PipelineError::persistence(&key, 1, format!("{:#}", e)))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipelineError::corrupt(&key, e))
    }

    /// All records in first-seen order
    pub fn records(&self) -> Result<Vec<ClassificationRecord>, PipelineError> {
        let mut records = Vec::new();
        for id in self.index()? {
            if let Some(record) = self.get(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> Result<usize, PipelineError> {
        Ok(self.index()?.len())
    }

    /// Stable JSON rendering of every record
    pub fn export_json(&self) -> Result<Vec<u8>, PipelineError> {
        let records = self.records()?;
        serde_json::to_vec_pretty(&records)
            .map_err(|e| PipelineError::corrupt(&keys::results_index(&self.collection), e))
    }
}
