//! GitHub REST adapter for the gateway seams.
//!
//! Every response is mapped onto `GatewayError` by status and rate limit
//! headers; retrying and waiting are left to the rate limit controller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::clock::Clock;
use crate::gateway::{GatewayError, ListPage, Metered, MetadataGateway, QuotaSnapshot, WorkListSource};
use crate::model::EntityRecord;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// README text kept per repository
const README_MAX_CHARS: usize = 3000;

const PER_PAGE: usize = 100;

/// Fallback wait when a throttle response carries no reset time
const DEFAULT_THROTTLE_SECS: i64 = 60;

/// Repository metadata (REST API)
#[derive(Debug, Clone, Deserialize)]
struct RepoResponse {
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    pushed_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
}

/// README content response
#[derive(Debug, Deserialize)]
struct ReadmeResponse {
    content: String,
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListedRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
}

impl RateLimit {
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.reset as i64, 0)
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitResources {
    pub core: RateLimit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

/// Whether a collection name is an organisation or a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerKind {
    Org,
    User,
}

impl OwnerKind {
    fn listing_url(self, api_base: &str, owner: &str, page: u32) -> String {
        match self {
            OwnerKind::Org => format!(
                "{}/orgs/{}/repos?per_page={}&page={}&type=public",
                api_base, owner, PER_PAGE, page
            ),
            OwnerKind::User => format!(
                "{}/users/{}/repos?per_page={}&page={}&type=owner",
                api_base, owner, PER_PAGE, page
            ),
        }
    }
}

/// GitHub API client
pub struct GitHubGateway {
    client: reqwest::Client,
    token: Option<String>,
    api_base: String,
    clock: Arc<dyn Clock>,
    owner_kinds: Mutex<HashMap<String, OwnerKind>>,
}

impl GitHubGateway {
    pub fn new(token: Option<String>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_api_base(token, clock, DEFAULT_API_BASE)
    }

    pub fn with_api_base(token: Option<String>, clock: Arc<dyn Clock>, api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repo-classify/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            clock,
            owner_kinds: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Build REST request with auth header if token available
    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// GET and map the status. Returns the response only on success.
    async fn send(&self, url: &str) -> Result<(reqwest::Response, Option<QuotaSnapshot>), GatewayError> {
        let start = std::time::Instant::now();
        let response = self
            .request(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        debug!(%url, status = status.as_u16(), elapsed_ms = start.elapsed().as_millis() as u64, "GET");

        let quota = parse_quota(response.headers());
        match classify_status(status, response.headers(), self.clock.now()) {
            Some(err) => Err(err),
            None => Ok((response, quota)),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Metered<T>, GatewayError> {
        let (response, quota) = self.send(url).await?;
        let value = response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Transient(format!("failed to parse response from {}: {}", url, e)))?;
        Ok(Metered::new(value, quota))
    }

    /// Decoded README text, `None` when the repository has none
    async fn get_readme(&self, id: &str) -> Result<Metered<Option<String>>, GatewayError> {
        let url = format!("{}/repos/{}/readme", self.api_base, id);
        match self.get_json::<ReadmeResponse>(&url).await {
            Ok(m) => Ok(Metered::new(decode_readme(&m.value.content, &m.value.encoding), m.quota)),
            Err(GatewayError::NotFound) => Ok(Metered::bare(None)),
            Err(e) => Err(e),
        }
    }

    /// Lower-cased root directory names; empty repositories have none
    async fn get_root_files(&self, id: &str) -> Result<Metered<BTreeSet<String>>, GatewayError> {
        let url = format!("{}/repos/{}/contents", self.api_base, id);
        match self.get_json::<Vec<ContentEntry>>(&url).await {
            Ok(m) => Ok(Metered::new(
                m.value.into_iter().map(|e| e.name.to_lowercase()).collect(),
                m.quota,
            )),
            Err(GatewayError::NotFound) => Ok(Metered::bare(BTreeSet::new())),
            Err(e) => Err(e),
        }
    }

    /// Check core rate limit status
    pub async fn rate_limit(&self) -> Result<RateLimitResources> {
        let url = format!("{}/rate_limit", self.api_base);

        let response = self
            .request(&url)
            .send()
            .await
            .context("Failed to check rate limit")?;

        if !response.status().is_success() {
            anyhow::bail!("GitHub API error {} on rate limit probe", response.status());
        }

        let data: RateLimitResponse = response.json().await.context("Failed to parse rate limit response")?;
        Ok(data.resources)
    }

    fn owner_kind(&self, owner: &str) -> Option<OwnerKind> {
        self.owner_kinds.lock().unwrap().get(owner).copied()
    }

    fn remember_owner_kind(&self, owner: &str, kind: OwnerKind) {
        self.owner_kinds.lock().unwrap().insert(owner.to_string(), kind);
    }

    async fn list_as(&self, kind: OwnerKind, owner: &str, page: u32) -> Result<Metered<ListPage>, GatewayError> {
        let url = kind.listing_url(&self.api_base, owner, page);
        let listed = self.get_json::<Vec<ListedRepo>>(&url).await?;
        let count = listed.value.len();
        Ok(Metered::new(
            ListPage {
                ids: listed.value.into_iter().map(|r| r.full_name).collect(),
                has_next: count >= PER_PAGE,
            },
            listed.quota,
        ))
    }
}

#[async_trait]
impl MetadataGateway for GitHubGateway {
    async fn fetch(&self, id: &str) -> Result<Metered<EntityRecord>, GatewayError> {
        let url = format!("{}/repos/{}", self.api_base, id);
        let repo = self.get_json::<RepoResponse>(&url).await?;
        let readme = self.get_readme(id).await?;
        let files = self.get_root_files(id).await?;

        // Most recent headers win
        let quota = files.quota.or(readme.quota).or(repo.quota);
        let record = repo_to_record(id, repo.value, readme.value, files.value, self.clock.now());
        Ok(Metered::new(record, quota))
    }
}

#[async_trait]
impl WorkListSource for GitHubGateway {
    async fn list_page(&self, collection: &str, page: u32) -> Result<Metered<ListPage>, GatewayError> {
        if let Some(kind) = self.owner_kind(collection) {
            return self.list_as(kind, collection, page).await;
        }

        // Try as org first, fall back to user
        match self.list_as(OwnerKind::Org, collection, page).await {
            Ok(listed) => {
                self.remember_owner_kind(collection, OwnerKind::Org);
                Ok(listed)
            }
            Err(GatewayError::NotFound) => {
                debug!(collection, "not an organisation, listing as user");
                let listed = self.list_as(OwnerKind::User, collection, page).await?;
                self.remember_owner_kind(collection, OwnerKind::User);
                Ok(listed)
            }
            Err(e) => Err(e),
        }
    }
}

fn repo_to_record(
    id: &str,
    repo: RepoResponse,
    readme: Option<String>,
    file_hints: BTreeSet<String>,
    fetched_at: DateTime<Utc>,
) -> EntityRecord {
    EntityRecord {
        id: id.to_string(),
        created_at: repo.created_at,
        pushed_at: repo.pushed_at,
        stars: repo.stargazers_count,
        language: repo.language,
        description: repo.description,
        topics: repo.topics.into_iter().collect(),
        readme_excerpt: readme,
        file_hints,
        fetched_at,
    }
}

/// Decode base64 README content (GitHub sends it with newlines)
fn decode_readme(content: &str, encoding: &str) -> Option<String> {
    if encoding != "base64" {
        return None;
    }
    let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = base64::engine::general_purpose::STANDARD.decode(cleaned).ok()?;
    let text = String::from_utf8_lossy(&decoded);
    Some(text.chars().take(README_MAX_CHARS).collect())
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
}

/// Quota advertised by `x-ratelimit-*` headers
pub fn parse_quota(headers: &HeaderMap) -> Option<QuotaSnapshot> {
    let remaining = header_i64(headers, "x-ratelimit-remaining")?;
    let limit = header_i64(headers, "x-ratelimit-limit")?;
    let reset_at = DateTime::from_timestamp(header_i64(headers, "x-ratelimit-reset")?, 0)?;
    Some(QuotaSnapshot {
        remaining: u32::try_from(remaining).ok()?,
        limit: u32::try_from(limit).ok()?,
        reset_at,
    })
}

/// Map a non-success response onto the gateway taxonomy
pub fn classify_status(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> Option<GatewayError> {
    if status.is_success() {
        return None;
    }

    if matches!(status.as_u16(), 404 | 410 | 451) {
        return Some(GatewayError::NotFound);
    }

    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        if header_i64(headers, "x-ratelimit-remaining") == Some(0) {
            let reset_at = header_i64(headers, "x-ratelimit-reset")
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(|| now + chrono::Duration::seconds(DEFAULT_THROTTLE_SECS));
            return Some(GatewayError::RateLimited { reset_at });
        }
        if let Some(secs) = header_i64(headers, "retry-after") {
            return Some(GatewayError::RateLimited {
                reset_at: now + chrono::Duration::seconds(secs.max(0)),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Some(GatewayError::RateLimited {
                reset_at: now + chrono::Duration::seconds(DEFAULT_THROTTLE_SECS),
            });
        }
        // Plain 403: private, blocked or disabled repository
        return Some(GatewayError::NotFound);
    }

    Some(GatewayError::Transient(format!("GitHub API error {}", status)))
}
