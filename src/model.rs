//! Core data types shared by every pipeline stage.
//!
//! Everything here is plain data: the work list and its identity, the raw
//! per-repository record, classification output, and the checkpoint that
//! records run progress between batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Label used when no candidate clears a dimension's threshold
pub const UNCLASSIFIED: &str = "Unclassified";

// === Work list ===

/// Identity of a work list: hex SHA-256 of its ordered ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkListId(pub String);

impl fmt::Display for WorkListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for humans
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Ordered, immutable enumeration of the repositories to classify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkList {
    ids: Vec<String>,
}

impl WorkList {
    /// Build a work list, dropping repeated ids (first occurrence wins).
    /// Paginated listings can return the same repo twice when the
    /// upstream set shifts between pages.
    pub fn new(ids: Vec<String>) -> Self {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids = ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        Self { ids }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Content hash over the full ordered list
    pub fn id(&self) -> WorkListId {
        let mut hasher = Sha256::new();
        for id in &self.ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        WorkListId(hex::encode(hasher.finalize()))
    }

    /// True when `self` is a strict prefix of `other` (other only appended ids)
    pub fn is_strict_prefix_of(&self, other: &WorkList) -> bool {
        self.ids.len() < other.ids.len() && other.ids[..self.ids.len()] == self.ids[..]
    }
}

// === Fetched state ===

/// Raw metadata for one repository as returned by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub stars: u64,
    pub language: Option<String>,
    pub description: Option<String>,
    pub topics: BTreeSet<String>,
    pub readme_excerpt: Option<String>,
    pub file_hints: BTreeSet<String>,
    /// Reference time for every age-derived signal
    pub fetched_at: DateTime<Utc>,
}

impl EntityRecord {
    /// Record with only an id; every optional field empty
    pub fn bare(id: &str, fetched_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            created_at: None,
            pushed_at: None,
            stars: 0,
            language: None,
            description: None,
            topics: BTreeSet::new(),
            readme_excerpt: None,
            file_hints: BTreeSet::new(),
            fetched_at,
        }
    }
}

/// Terminal fetch result for one id within a batch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok(Box<EntityRecord>),
    NotFound,
    TransientError(String),
}

// === Classification output ===

/// Where a record's synopsis came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynopsisSource {
    Description,
    Readme,
    Identifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f64,
}

/// Outcome of one dimension for one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub dimension: String,
    pub primary_label: String,
    pub primary_confidence: f64,
    pub secondary_labels: Vec<LabelScore>,
    pub evidence: Vec<String>,
}

impl DimensionResult {
    pub fn unclassified(dimension: &str) -> Self {
        Self {
            dimension: dimension.to_string(),
            primary_label: UNCLASSIFIED.to_string(),
            primary_confidence: 0.0,
            secondary_labels: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn is_classified(&self) -> bool {
        self.primary_label != UNCLASSIFIED
    }

    /// Primary followed by secondary labels
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_label.as_str())
            .chain(self.secondary_labels.iter().map(|s| s.label.as_str()))
    }
}

/// Every dimension result for one repository; the unit written to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub id: String,
    pub ruleset_version: String,
    pub synopsis: String,
    pub synopsis_source: SynopsisSource,
    pub stars: u64,
    pub language: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub dimensions: Vec<DimensionResult>,
}

impl ClassificationRecord {
    pub fn dimension(&self, name: &str) -> Option<&DimensionResult> {
        self.dimensions.iter().find(|d| d.dimension == name)
    }
}

// === Progress ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Transient,
}

/// Failure bookkeeping for one id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub retry_count: u32,
    pub reason: String,
    /// Permanently failed ids are skipped on resume
    pub permanent: bool,
}

/// Durable progress marker for one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub collection: String,
    pub work_list_id: WorkListId,
    pub total_count: usize,
    pub completed_ids: BTreeSet<String>,
    pub failed_ids: BTreeMap<String, FailureRecord>,
    /// One past the highest work list position that has settled
    pub cursor: usize,
    pub throttled_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(collection: &str, work_list: &WorkList, now: DateTime<Utc>) -> Self {
        Self {
            collection: collection.to_string(),
            work_list_id: work_list.id(),
            total_count: work_list.len(),
            completed_ids: BTreeSet::new(),
            failed_ids: BTreeMap::new(),
            cursor: 0,
            throttled_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed or permanently failed
    pub fn is_settled(&self, id: &str) -> bool {
        self.completed_ids.contains(id)
            || self.failed_ids.get(id).map(|f| f.permanent).unwrap_or(false)
    }

    pub fn mark_completed(&mut self, id: &str) {
        self.failed_ids.remove(id);
        self.completed_ids.insert(id.to_string());
    }

    /// Gone upstream: never retried automatically
    pub fn mark_not_found(&mut self, id: &str) {
        let retry_count = self.failed_ids.get(id).map(|f| f.retry_count).unwrap_or(0);
        self.failed_ids.insert(
            id.to_string(),
            FailureRecord {
                kind: FailureKind::NotFound,
                retry_count,
                reason: "not found".to_string(),
                permanent: true,
            },
        );
    }

    /// Count a transient failure against the id's retry budget.
    /// Returns true when the id just became permanently failed.
    pub fn mark_transient_failure(&mut self, id: &str, reason: &str, max_retries: u32) -> bool {
        let entry = self
            .failed_ids
            .entry(id.to_string())
            .or_insert_with(|| FailureRecord {
                kind: FailureKind::Transient,
                retry_count: 0,
                reason: String::new(),
                permanent: false,
            });
        entry.kind = FailureKind::Transient;
        entry.retry_count += 1;
        entry.reason = reason.to_string();
        entry.permanent = entry.retry_count >= max_retries;
        entry.permanent
    }

    /// Monotonic: a lower value never moves the cursor back
    pub fn advance_cursor(&mut self, to: usize) {
        self.cursor = self.cursor.max(to);
    }

    /// Adopt a grown work list whose prefix matches the current one
    pub fn extend_to(&mut self, work_list: &WorkList) {
        self.work_list_id = work_list.id();
        self.total_count = work_list.len();
    }

    /// Give permanently failed transient entries a fresh retry budget.
    /// NotFound entries stay failed.
    pub fn requeue_transient_failures(&mut self) -> usize {
        let mut requeued = 0;
        for failure in self.failed_ids.values_mut() {
            if failure.permanent && failure.kind == FailureKind::Transient {
                failure.permanent = false;
                failure.retry_count = 0;
                requeued += 1;
            }
        }
        requeued
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = (&String, &FailureRecord)> {
        self.failed_ids.iter().filter(|(_, f)| f.permanent)
    }

    pub fn pending_count(&self) -> usize {
        let permanent = self.permanent_failures().count();
        self.total_count
            .saturating_sub(self.completed_ids.len())
            .saturating_sub(permanent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[&str]) -> WorkList {
        WorkList::new(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_work_list_id_is_order_sensitive() {
        let a = list(&["org/a", "org/b"]);
        let b = list(&["org/b", "org/a"]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), list(&["org/a", "org/b"]).id());
    }

    #[test]
    fn test_work_list_dedups_keeping_first() {
        let wl = list(&["org/a", "org/b", "org/a", " ", "org/c"]);
        assert_eq!(wl.ids(), &["org/a", "org/b", "org/c"]);
    }

    #[test]
    fn test_strict_prefix() {
        let old = list(&["org/a", "org/b"]);
        let grown = list(&["org/a", "org/b", "org/c"]);
        let reordered = list(&["org/b", "org/a", "org/c"]);

        assert!(old.is_strict_prefix_of(&grown));
        assert!(!old.is_strict_prefix_of(&reordered));
        // Equal lists are not a strict prefix
        assert!(!old.is_strict_prefix_of(&old));
    }

    #[test]
    fn test_completion_clears_failure() {
        let wl = list(&["org/a"]);
        let mut cp = Checkpoint::new("org", &wl, Utc::now());

        cp.mark_transient_failure("org/a", "502", 3);
        assert!(cp.failed_ids.contains_key("org/a"));

        cp.mark_completed("org/a");
        assert!(cp.completed_ids.contains("org/a"));
        assert!(!cp.failed_ids.contains_key("org/a"));
    }

    #[test]
    fn test_transient_failure_becomes_permanent_at_budget() {
        let wl = list(&["org/a"]);
        let mut cp = Checkpoint::new("org", &wl, Utc::now());

        assert!(!cp.mark_transient_failure("org/a", "timeout", 2));
        assert!(!cp.is_settled("org/a"));
        assert!(cp.mark_transient_failure("org/a", "timeout", 2));
        assert!(cp.is_settled("org/a"));

        // Retry-failed hands the budget back
        assert_eq!(cp.requeue_transient_failures(), 1);
        assert!(!cp.is_settled("org/a"));
        assert_eq!(cp.failed_ids["org/a"].retry_count, 0);
    }

    #[test]
    fn test_not_found_is_never_requeued() {
        let wl = list(&["org/gone"]);
        let mut cp = Checkpoint::new("org", &wl, Utc::now());
        cp.mark_not_found("org/gone");

        assert!(cp.is_settled("org/gone"));
        assert_eq!(cp.requeue_transient_failures(), 0);
        assert!(cp.is_settled("org/gone"));
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let wl = list(&["org/a", "org/b", "org/c"]);
        let mut cp = Checkpoint::new("org", &wl, Utc::now());
        cp.advance_cursor(3);
        cp.advance_cursor(1);
        assert_eq!(cp.cursor, 3);
    }

    #[test]
    fn test_pending_count() {
        let wl = list(&["org/a", "org/b", "org/c", "org/d"]);
        let mut cp = Checkpoint::new("org", &wl, Utc::now());
        cp.mark_completed("org/a");
        cp.mark_not_found("org/b");
        cp.mark_transient_failure("org/c", "502", 3);
        // c is requeued, so still pending
        assert_eq!(cp.pending_count(), 2);
    }
}
