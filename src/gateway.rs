//! Seams between the pipeline and the remote API.
//!
//! `MetadataGateway` fetches one repository, `WorkListSource` pages through
//! an owner's repositories. Both report the quota the server advertised so
//! the rate limit controller can track it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{EntityRecord, WorkList};
use crate::ratelimit::{CallFailure, CallOutcome, RateLimitController};

/// Quota state reported alongside a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

/// A response value plus the quota headers that came with it
#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub value: T,
    pub quota: Option<QuotaSnapshot>,
}

impl<T> Metered<T> {
    pub fn new(value: T, quota: Option<QuotaSnapshot>) -> Self {
        Self { value, quota }
    }

    /// Value without quota information
    pub fn bare(value: T) -> Self {
        Self { value, quota: None }
    }
}

/// How a single remote call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Transient(String),
}

#[async_trait]
pub trait MetadataGateway: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Metered<EntityRecord>, GatewayError>;
}

/// One page of an owner's repository listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub ids: Vec<String>,
    pub has_next: bool,
}

#[async_trait]
pub trait WorkListSource: Send + Sync {
    /// `page` starts at 1
    async fn list_page(&self, collection: &str, page: u32) -> Result<Metered<ListPage>, GatewayError>;
}

/// Enumerate a full work list through the controller, sleeping out throttles
pub async fn enumerate_work_list(
    source: &dyn WorkListSource,
    controller: &RateLimitController,
    collection: &str,
) -> Result<WorkList, GatewayError> {
    let mut ids = Vec::new();
    let mut page = 1;

    loop {
        let current = page;
        let outcome = controller
            .execute(move || source.list_page(collection, current))
            .await;

        match outcome {
            CallOutcome::Ready(listing) => {
                debug!(collection, page, count = listing.ids.len(), "listed page");
                ids.extend(listing.ids);
                if !listing.has_next {
                    break;
                }
                page += 1;
            }
            CallOutcome::Wait(wait) => {
                info!(collection, page, wait_secs = wait.as_secs(), "listing throttled, waiting");
                tokio::time::sleep(wait).await;
            }
            CallOutcome::Failed(CallFailure::NotFound) => return Err(GatewayError::NotFound),
            CallOutcome::Failed(CallFailure::TransientExhausted { attempts, last_error }) => {
                return Err(GatewayError::Transient(format!(
                    "page {} failed after {} attempts: {}",
                    page, attempts, last_error
                )));
            }
        }
    }

    Ok(WorkList::new(ids))
}
