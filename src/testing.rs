//! In-memory doubles for the store, clock and GitHub seams.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::gateway::{GatewayError, ListPage, Metered, MetadataGateway, WorkListSource};
use crate::model::EntityRecord;
use crate::store::ObjectStore;

// === Clock ===

/// Clock that follows tokio's (pausable) time plus a manual offset.
/// Under `start_paused` a `sleep` moves it forward too.
pub struct ManualClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(fixed_now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.origin.elapsed() + *self.offset.lock().unwrap();
        self.base + chrono::Duration::from_std(elapsed).unwrap()
    }
}

/// Reference instant used across tests
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

// === Records ===

/// Record with nothing but an id, fetched at `fixed_now()`
pub fn record(id: &str) -> EntityRecord {
    EntityRecord::bare(id, fixed_now())
}

/// A plausible, fully populated record
pub fn sample_record(id: &str, now: DateTime<Utc>) -> EntityRecord {
    let name = id.rsplit('/').next().unwrap_or(id);
    EntityRecord {
        id: id.to_string(),
        created_at: Some(now - chrono::Duration::days(400)),
        pushed_at: Some(now - chrono::Duration::days(30)),
        stars: 12,
        language: Some("Python".to_string()),
        description: Some(format!("Serverless Lambda sample for {}", name)),
        topics: ["aws", "lambda"].iter().map(|t| t.to_string()).collect(),
        readme_excerpt: None,
        file_hints: ["readme.md", "template.yaml"].iter().map(|f| f.to_string()).collect(),
        fetched_at: now,
    }
}

// === Object store ===

struct PutFault {
    pattern: String,
    remaining_ok: usize,
}

/// Mutex-guarded map with put fault injection
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: Mutex<Vec<PutFault>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `after_ok` puts to keys containing `pattern` succeed, then fail every later one
    pub fn fail_puts_matching(&self, pattern: &str, after_ok: usize) {
        self.faults.lock().unwrap().push(PutFault {
            pattern: pattern.to_string(),
            remaining_ok: after_ok,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.objects.lock().unwrap().clone()
    }

    fn check_fault(&self, key: &str) -> anyhow::Result<()> {
        let mut faults = self.faults.lock().unwrap();
        for fault in faults.iter_mut().filter(|f| key.contains(&f.pattern)) {
            if fault.remaining_ok == 0 {
                anyhow::bail!("injected write failure for {}", key);
            }
            fault.remaining_ok -= 1;
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get_object(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    fn put_object(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.check_fault(key)?;
        self.objects.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> anyhow::Result<bool> {
        let mut objects = self.objects.lock().unwrap();
        if objects.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        objects.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    fn delete_object(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.objects.lock().unwrap().remove(key).is_some())
    }

    fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// === Gateways ===

/// Scripted response for one fetch
#[derive(Debug, Clone)]
pub enum Scripted {
    Ok,
    NotFound,
    Transient(&'static str),
    /// Throttled until `now + secs`
    RateLimited(i64),
}

/// Gateway replaying per-id scripts; unscripted fetches succeed
pub struct ScriptedGateway {
    clock: Arc<dyn Clock>,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    records: Mutex<HashMap<String, EntityRecord>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            scripts: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Queue responses for `id`, consumed one per fetch
    pub fn script(&self, id: &str, steps: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .extend(steps);
    }

    /// Serve this record instead of `sample_record`
    pub fn with_record(&self, record: EntityRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|i| *i == id).count()
    }

    pub fn total_fetches(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Ids in fetch order
    pub fn fetched_ids(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn reset_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

#[async_trait]
impl MetadataGateway for ScriptedGateway {
    async fn fetch(&self, id: &str) -> Result<Metered<EntityRecord>, GatewayError> {
        self.log.lock().unwrap().push(id.to_string());

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|q| q.pop_front())
            .unwrap_or(Scripted::Ok);

        let now = self.clock.now();
        match step {
            Scripted::Ok => {
                let record = self
                    .records
                    .lock()
                    .unwrap()
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| sample_record(id, now));
                Ok(Metered::bare(record))
            }
            Scripted::NotFound => Err(GatewayError::NotFound),
            Scripted::Transient(msg) => Err(GatewayError::Transient(msg.to_string())),
            Scripted::RateLimited(secs) => Err(GatewayError::RateLimited {
                reset_at: now + chrono::Duration::seconds(secs),
            }),
        }
    }
}

/// Fixed paginated listing
pub struct StaticListing {
    pages: Mutex<Vec<Vec<String>>>,
    missing: bool,
}

impl StaticListing {
    pub fn new(pages: Vec<Vec<&str>>) -> Self {
        Self {
            pages: Mutex::new(
                pages
                    .into_iter()
                    .map(|p| p.into_iter().map(String::from).collect())
                    .collect(),
            ),
            missing: false,
        }
    }

    /// Single-page listing
    pub fn of(ids: &[String]) -> Self {
        Self {
            pages: Mutex::new(vec![ids.to_vec()]),
            missing: false,
        }
    }

    /// Owner does not exist
    pub fn missing() -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            missing: true,
        }
    }

    /// Replace the listing (upstream changed)
    pub fn set_single_page(&self, ids: &[String]) {
        *self.pages.lock().unwrap() = vec![ids.to_vec()];
    }
}

#[async_trait]
impl WorkListSource for StaticListing {
    async fn list_page(&self, _collection: &str, page: u32) -> Result<Metered<ListPage>, GatewayError> {
        if self.missing {
            return Err(GatewayError::NotFound);
        }
        let pages = self.pages.lock().unwrap();
        let idx = page.saturating_sub(1) as usize;
        let ids = pages.get(idx).cloned().unwrap_or_default();
        Ok(Metered::bare(ListPage {
            ids,
            has_next: idx + 1 < pages.len(),
        }))
    }
}

/// Ids `org/r00`..`org/r{n-1}`
pub fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("org/r{:02}", i)).collect()
}

/// Set of strings from literals
pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}
