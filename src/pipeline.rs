//! Batch pipeline driver.
//!
//! Resume, diff, fetch, classify, persist, checkpoint. One batch at a time:
//! results are written to the sink before the checkpoint that marks them
//! complete, so a crash anywhere inside a batch replays at most that batch.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, Lease};
use crate::classify::RuleSet;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::gateway::{enumerate_work_list, MetadataGateway, WorkListSource};
use crate::model::{Checkpoint, ClassificationRecord, EntityRecord, FetchOutcome, WorkList};
use crate::ratelimit::{CallFailure, CallOutcome, RateLimitController};
use crate::signals;
use crate::sink::ResultSink;
use crate::store::ObjectStore;

/// How often a throttle sleep checks for a stop request
const STOP_POLL: Duration = Duration::from_secs(1);

/// Counts for one settled batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_num: usize,
    pub pass: usize,
    pub size: usize,
    pub completed: usize,
    pub not_found: usize,
    /// Transient exhaustions this batch (retried in a later pass unless permanent)
    pub failed: usize,
    pub became_permanent: usize,
    /// Throttled ids left unfetched because a stop arrived mid-wait
    pub deferred: usize,
    pub completed_total: usize,
    pub total: usize,
}

/// Events reported to the caller while running
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Resumed {
        total: usize,
        completed: usize,
        permanent_failures: usize,
        pending: usize,
        extended_by: usize,
        requeued: usize,
    },
    Throttled {
        wait: Duration,
        ids: usize,
    },
    Batch(BatchReport),
}

/// Final tally of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub collection: String,
    pub total: usize,
    pub completed_total: usize,
    pub completed_this_run: usize,
    pub not_found_this_run: usize,
    /// Every permanently failed id with its reason
    pub failed_permanent: Vec<(String, String)>,
    /// Still unsettled (limit reached or stopped)
    pub pending: usize,
    pub batches: usize,
    pub passes: usize,
    pub throttle_waits: usize,
    pub requeued: usize,
    pub stopped: bool,
}

impl RunSummary {
    /// Every entity settled and none failed
    pub fn is_clean(&self) -> bool {
        self.failed_permanent.is_empty() && self.pending == 0
    }
}

pub struct Driver {
    collection: String,
    gateway: Arc<dyn MetadataGateway>,
    source: Arc<dyn WorkListSource>,
    controller: RateLimitController,
    checkpoints: CheckpointStore,
    sink: ResultSink,
    rules: RuleSet,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    holder: String,
}

impl Driver {
    pub fn new(
        collection: &str,
        store: Arc<dyn ObjectStore>,
        gateway: Arc<dyn MetadataGateway>,
        source: Arc<dyn WorkListSource>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            gateway,
            source,
            controller: RateLimitController::new(config.rate_limit, clock.clone()),
            checkpoints: CheckpointStore::new(store.clone(), collection, config.persist),
            sink: ResultSink::new(store, collection, config.persist),
            rules: RuleSet::builtin(),
            clock,
            config,
            holder: format!("run-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Run until every entity in scope is settled, the limit is reached,
    /// or `should_stop` returns true between batches or during a throttle wait.
    ///
    /// The lease is released on every exit path that returns.
    pub async fn run<F, S>(&self, mut on_progress: F, should_stop: S) -> Result<RunSummary, PipelineError>
    where
        F: FnMut(&Progress),
        S: Fn() -> bool,
    {
        let mut lease = self
            .checkpoints
            .acquire_lease(&self.holder, self.config.lease_ttl, self.clock.now())?;
        info!(collection = %self.collection, holder = %self.holder, "lease acquired");

        let result = self.run_leased(&mut lease, &mut on_progress, &should_stop).await;

        if let Err(e) = self.checkpoints.release_lease(&self.holder) {
            warn!(collection = %self.collection, error = %e, "failed to release lease");
        }
        result
    }

    async fn run_leased<F, S>(
        &self,
        lease: &mut Lease,
        on_progress: &mut F,
        should_stop: &S,
    ) -> Result<RunSummary, PipelineError>
    where
        F: FnMut(&Progress),
        S: Fn() -> bool,
    {
        debug!(collection = %self.collection, "phase: init");
        let (work_list, mut checkpoint, extended_by) = self.init().await?;

        debug!(collection = %self.collection, "phase: resuming");
        let mut requeued = 0;
        if self.config.retry_failed {
            requeued = checkpoint.requeue_transient_failures();
            if requeued > 0 {
                info!(collection = %self.collection, requeued, "requeued failed entities");
                self.save_checkpoint(&mut checkpoint, lease, None).await?;
            }
        }

        if let Some(until) = checkpoint.throttled_until {
            if until > self.clock.now() {
                info!(collection = %self.collection, %until, "restoring persisted throttle");
                self.controller.restore_throttle(until);
            }
        }

        // The limit fixes the set of entities this run may touch
        let initial = pending(&work_list, &checkpoint, None);
        let scope: Option<HashSet<String>> = self
            .config
            .limit
            .map(|limit| initial.iter().take(limit).map(|(_, id)| id.clone()).collect());

        on_progress(&Progress::Resumed {
            total: work_list.len(),
            completed: checkpoint.completed_ids.len(),
            permanent_failures: checkpoint.permanent_failures().count(),
            pending: scope.as_ref().map(|s| s.len()).unwrap_or(initial.len()),
            extended_by,
            requeued,
        });

        let mut summary = RunSummary {
            collection: self.collection.clone(),
            requeued,
            ..Default::default()
        };

        'passes: loop {
            let todo = pending(&work_list, &checkpoint, scope.as_ref());
            if todo.is_empty() {
                break;
            }
            summary.passes += 1;
            debug!(collection = %self.collection, pass = summary.passes, pending = todo.len(), "starting pass");

            for batch in todo.chunks(self.config.batch_size) {
                if should_stop() {
                    info!(collection = %self.collection, "stop requested, exiting between batches");
                    summary.stopped = true;
                    break 'passes;
                }

                summary.batches += 1;
                let mut report = self
                    .process_batch(batch, &mut checkpoint, lease, &mut summary, &mut *on_progress, should_stop)
                    .await?;
                report.batch_num = summary.batches;
                report.pass = summary.passes;
                let deferred = report.deferred;
                on_progress(&Progress::Batch(report));

                if deferred > 0 {
                    info!(collection = %self.collection, deferred, "stop requested during throttle wait");
                    summary.stopped = true;
                    break 'passes;
                }
            }
        }

        debug!(collection = %self.collection, "phase: draining");
        summary.total = work_list.len();
        summary.completed_total = checkpoint.completed_ids.len();
        summary.failed_permanent = checkpoint
            .permanent_failures()
            .map(|(id, f)| (id.clone(), f.reason.clone()))
            .collect();
        summary.pending = pending(&work_list, &checkpoint, None).len();

        info!(
            collection = %self.collection,
            completed = summary.completed_total,
            failed = summary.failed_permanent.len(),
            pending = summary.pending,
            "run finished"
        );
        Ok(summary)
    }

    /// Load or build the work list and reconcile it with the checkpoint.
    /// Returns how many ids a grown work list added.
    async fn init(&self) -> Result<(WorkList, Checkpoint, usize), PipelineError> {
        let stored = self.checkpoints.load()?;
        let snapshot = self.checkpoints.load_work_list()?;

        let (work_list, enumerated) = match &snapshot {
            Some(s) if !self.config.refresh_work_list => (s.clone(), false),
            _ => match enumerate_work_list(self.source.as_ref(), &self.controller, &self.collection).await {
                Ok(fresh) => {
                    info!(collection = %self.collection, count = fresh.len(), "work list enumerated");
                    (fresh, true)
                }
                Err(e) => match &snapshot {
                    Some(s) => {
                        warn!(collection = %self.collection, error = %e, "enumeration failed, using stored snapshot");
                        (s.clone(), false)
                    }
                    None => {
                        return Err(PipelineError::WorkListUnavailable {
                            collection: self.collection.clone(),
                            message: e.to_string(),
                        })
                    }
                },
            },
        };

        if work_list.is_empty() {
            warn!(collection = %self.collection, "work list is empty");
        }

        let now = self.clock.now();
        let fresh_id = work_list.id();

        let (checkpoint, extended_by) = match stored {
            None => {
                self.checkpoints.save_work_list(&work_list).await?;
                let checkpoint = Checkpoint::new(&self.collection, &work_list, now);
                self.checkpoints.save(&checkpoint).await?;
                (checkpoint, 0)
            }
            Some(checkpoint) if checkpoint.work_list_id == fresh_id => {
                if enumerated && snapshot.is_none() {
                    self.checkpoints.save_work_list(&work_list).await?;
                }
                (checkpoint, 0)
            }
            Some(mut checkpoint) => {
                let grown = snapshot
                    .as_ref()
                    .filter(|s| s.id() == checkpoint.work_list_id)
                    .map(|s| s.is_strict_prefix_of(&work_list))
                    .unwrap_or(false);

                if !grown {
                    return Err(PipelineError::WorkListMismatch {
                        collection: self.collection.clone(),
                        expected: checkpoint.work_list_id.clone(),
                        expected_len: checkpoint.total_count,
                        found: fresh_id,
                        found_len: work_list.len(),
                    });
                }

                let extended_by = work_list.len() - checkpoint.total_count;
                info!(collection = %self.collection, extended_by, "work list grew, extending checkpoint");
                self.checkpoints.save_work_list(&work_list).await?;
                checkpoint.extend_to(&work_list);
                checkpoint.updated_at = now;
                self.checkpoints.save(&checkpoint).await?;
                (checkpoint, extended_by)
            }
        };

        Ok((work_list, checkpoint, extended_by))
    }

    async fn process_batch<F, S>(
        &self,
        batch: &[(usize, String)],
        checkpoint: &mut Checkpoint,
        lease: &mut Lease,
        summary: &mut RunSummary,
        on_progress: &mut F,
        should_stop: &S,
    ) -> Result<BatchReport, PipelineError>
    where
        F: FnMut(&Progress),
        S: Fn() -> bool,
    {
        debug!(collection = %self.collection, size = batch.len(), "phase: batch fetching");
        let mut outcomes: Vec<(usize, String, FetchOutcome)> = Vec::with_capacity(batch.len());
        let mut todo: Vec<(usize, String)> = batch.to_vec();

        while !todo.is_empty() {
            let mut throttled = Vec::new();
            let mut longest = Duration::ZERO;

            for (pos, id, outcome) in self.fetch_all(&todo).await {
                match outcome {
                    CallOutcome::Ready(record) => outcomes.push((pos, id, FetchOutcome::Ok(Box::new(record)))),
                    CallOutcome::Wait(wait) => {
                        longest = longest.max(wait);
                        throttled.push((pos, id));
                    }
                    CallOutcome::Failed(CallFailure::NotFound) => outcomes.push((pos, id, FetchOutcome::NotFound)),
                    CallOutcome::Failed(CallFailure::TransientExhausted { attempts, last_error }) => outcomes.push((
                        pos,
                        id,
                        FetchOutcome::TransientError(format!("{} (after {} attempts)", last_error, attempts)),
                    )),
                }
            }

            throttled.sort();
            todo = throttled;
            if todo.is_empty() {
                break;
            }

            // Throttled: persist before suspending, then refetch only those ids
            summary.throttle_waits += 1;
            self.save_checkpoint(checkpoint, lease, Some(longest)).await?;
            on_progress(&Progress::Throttled { wait: longest, ids: todo.len() });
            info!(collection = %self.collection, wait_secs = longest.as_secs(), ids = todo.len(), "throttled, sleeping");
            if sleep_unless_stopped(longest, should_stop).await {
                break;
            }
        }

        // buffer_unordered completes in any order
        outcomes.sort_by_key(|(pos, _, _)| *pos);

        debug!(collection = %self.collection, "phase: batch classifying");
        let records: Vec<ClassificationRecord> = outcomes
            .iter()
            .filter_map(|(_, id, outcome)| match outcome {
                FetchOutcome::Ok(record) => Some(self.classify(id, record)),
                _ => None,
            })
            .collect();

        debug!(collection = %self.collection, records = records.len(), "phase: batch persisting");
        self.sink.upsert(&records).await?;

        debug!(collection = %self.collection, "phase: checkpoint advance");
        let mut report = BatchReport {
            size: batch.len(),
            deferred: todo.len(),
            ..Default::default()
        };
        for (_, id, outcome) in &outcomes {
            match outcome {
                FetchOutcome::Ok(_) => {
                    checkpoint.mark_completed(id);
                    report.completed += 1;
                }
                FetchOutcome::NotFound => {
                    checkpoint.mark_not_found(id);
                    report.not_found += 1;
                }
                FetchOutcome::TransientError(reason) => {
                    report.failed += 1;
                    if checkpoint.mark_transient_failure(id, reason, self.config.max_entity_retries) {
                        report.became_permanent += 1;
                        warn!(collection = %self.collection, %id, %reason, "entity failed permanently");
                    }
                }
            }
        }
        // Deferred ids keep the cursor at the first of them
        let next = todo
            .iter()
            .map(|(pos, _)| *pos)
            .min()
            .or_else(|| batch.iter().map(|(pos, _)| *pos).max().map(|last| last + 1));
        if let Some(next) = next {
            checkpoint.advance_cursor(next);
        }
        self.save_checkpoint(checkpoint, lease, None).await?;

        let (remaining, limit) = self.controller.quota();
        debug!(collection = %self.collection, ?remaining, ?limit, completed = report.completed, "batch checkpointed");

        summary.completed_this_run += report.completed;
        summary.not_found_this_run += report.not_found;
        report.completed_total = checkpoint.completed_ids.len();
        report.total = checkpoint.total_count;
        Ok(report)
    }

    async fn fetch_all(&self, items: &[(usize, String)]) -> Vec<(usize, String, CallOutcome<EntityRecord>)> {
        let gateway = self.gateway.as_ref();
        let controller = &self.controller;

        stream::iter(items.iter().cloned())
            .map(|(pos, id)| async move {
                let outcome = controller.execute(|| gateway.fetch(&id)).await;
                (pos, id, outcome)
            })
            .buffer_unordered(self.config.parallelism)
            .collect()
            .await
    }

    fn classify(&self, id: &str, record: &EntityRecord) -> ClassificationRecord {
        let bag = signals::extract(record);
        let dimensions = self.rules.classify(&bag);
        debug!(
            %id,
            classified = dimensions.iter().filter(|d| d.is_classified()).count(),
            dimensions = dimensions.len(),
            "classified"
        );
        ClassificationRecord {
            id: id.to_string(),
            ruleset_version: self.rules.version.to_string(),
            synopsis: bag.synopsis.clone(),
            synopsis_source: bag.synopsis_source,
            stars: record.stars,
            language: record.language.clone(),
            pushed_at: record.pushed_at,
            dimensions,
        }
    }

    /// Renew the lease (covering an upcoming sleep) and persist the checkpoint
    async fn save_checkpoint(
        &self,
        checkpoint: &mut Checkpoint,
        lease: &mut Lease,
        sleeping: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let extra = sleeping
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);

        *lease = self
            .checkpoints
            .renew_lease(lease, self.config.lease_ttl + extra, now)?;

        checkpoint.throttled_until = self.controller.throttled_until();
        checkpoint.updated_at = now;
        self.checkpoints.save(checkpoint).await
    }
}

/// Sleep for `wait`, returning early with `true` once `should_stop` holds
async fn sleep_unless_stopped<S: Fn() -> bool>(wait: Duration, should_stop: &S) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if should_stop() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((deadline - now).min(STOP_POLL)).await;
    }
}

/// Unsettled work list entries in order, with their positions
fn pending(
    work_list: &WorkList,
    checkpoint: &Checkpoint,
    scope: Option<&HashSet<String>>,
) -> Vec<(usize, String)> {
    work_list
        .ids()
        .iter()
        .enumerate()
        .filter(|(_, id)| !checkpoint.is_settled(id))
        .filter(|(_, id)| scope.map(|s| s.contains(*id)).unwrap_or(true))
        .map(|(pos, id)| (pos, id.clone()))
        .collect()
}
