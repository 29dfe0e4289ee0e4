//! Run-level error taxonomy.
//!
//! Transient API failures and per-dimension evaluation failures never reach
//! this type: the rate limit controller and the classification engine absorb
//! them. What remains are conditions that stop a run.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::WorkListId;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A checkpoint, work list or result write failed past its retry budget.
    /// The stored checkpoint was not advanced, so the run is safe to resume.
    #[error("persistence failed for '{key}' after {attempts} attempts: {message}")]
    PersistenceFatal {
        key: String,
        attempts: u32,
        message: String,
    },

    /// The freshly loaded work list does not extend the one the checkpoint
    /// was built from. Needs an operator decision (`reset` or keep).
    #[error(
        "work list for '{collection}' changed: checkpoint expects {expected} ({expected_len} ids), found {found} ({found_len} ids)"
    )]
    WorkListMismatch {
        collection: String,
        expected: WorkListId,
        expected_len: usize,
        found: WorkListId,
        found_len: usize,
    },

    /// Another run holds the lease for this collection
    #[error("collection '{collection}' is already being processed by {holder} (lease until {expires_at})")]
    AlreadyRunning {
        collection: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// No stored snapshot and enumeration failed
    #[error("work list for '{collection}' unavailable: {message}")]
    WorkListUnavailable { collection: String, message: String },

    /// Stored state could not be read or decoded
    #[error("stored state for '{key}' is unreadable: {message}")]
    CorruptState { key: String, message: String },
}

impl PipelineError {
    pub(crate) fn persistence(key: &str, attempts: u32, err: impl std::fmt::Display) -> Self {
        Self::PersistenceFatal {
            key: key.to_string(),
            attempts,
            message: err.to_string(),
        }
    }

    pub(crate) fn corrupt(key: &str, err: impl std::fmt::Display) -> Self {
        Self::CorruptState {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}
