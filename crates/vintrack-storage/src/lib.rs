//! Persistence facade, collaborator clients and retry utilities for vintrack.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;
use vintrack_core::{CanonicalListing, ListingQuery};

pub mod postgres;

pub use postgres::PgListingStore;

pub const CRATE_NAME: &str = "vintrack-storage";

pub const PRIMARY_KEY_CONSTRAINT: &str = "canonical_listings_pkey";
pub const SOURCE_URL_CONSTRAINT: &str = "canonical_listings_source_url_key";
pub const VIN_CONSTRAINT: &str = "canonical_listings_vin_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Errors that can tell whether another attempt might succeed.
pub trait TransientError: std::fmt::Display + Sized {
    fn disposition(&self) -> RetryDisposition;
    fn timed_out(after: Duration) -> Self;
}

/// Runs `call` under a per-attempt timeout, retrying retryable failures with capped backoff.
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    timeout: Duration,
    operation: &str,
    mut call: F,
) -> Result<T, E>
where
    E: TransientError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                let delay = policy.delay_for_attempt(attempt);
                warn!(operation, attempt, error = %err, ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint {constraint} violated")]
    UniqueViolation { constraint: String },
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

impl TransientError for StoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Timeout(_) | StoreError::Unavailable(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    fn timed_out(after: Duration) -> Self {
        StoreError::Timeout(after)
    }
}

/// Persistence facade. Every method is an individually atomic unit.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_url(&self, url: &str) -> Result<Option<CanonicalListing>, StoreError>;

    async fn find_by_vin(&self, vin: &str) -> Result<Option<CanonicalListing>, StoreError>;

    /// Inserts a row for `listing.source_url`, or replaces the row already stored
    /// under that URL while keeping its id.
    async fn upsert_by_url(&self, listing: &CanonicalListing)
        -> Result<CanonicalListing, StoreError>;

    async fn update_by_id(
        &self,
        id: Uuid,
        listing: &CanonicalListing,
    ) -> Result<CanonicalListing, StoreError>;

    async fn delete_by_id(&self, id: Uuid) -> Result<(), StoreError>;

    /// Replaces the listing's whole association set (delete-then-insert).
    async fn replace_option_associations(
        &self,
        listing_id: Uuid,
        option_ids: &[i64],
    ) -> Result<(), StoreError>;

    async fn option_associations(&self, listing_id: Uuid) -> Result<Vec<i64>, StoreError>;

    async fn query(&self, query: &ListingQuery) -> Result<Vec<CanonicalListing>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<Uuid, CanonicalListing>,
    associations: HashMap<Uuid, Vec<i64>>,
}

impl MemoryState {
    fn id_for_url(&self, url: &str) -> Option<Uuid> {
        self.rows
            .values()
            .find(|row| row.source_url == url)
            .map(|row| row.id)
    }

    /// Mirrors the relational unique constraints on source_url and vin.
    fn check_unique(&self, listing: &CanonicalListing, own_id: Uuid) -> Result<(), StoreError> {
        for row in self.rows.values().filter(|row| row.id != own_id) {
            if row.source_url == listing.source_url {
                return Err(StoreError::UniqueViolation {
                    constraint: SOURCE_URL_CONSTRAINT.to_string(),
                });
            }
            if listing.vin.is_some() && row.vin == listing.vin {
                return Err(StoreError::UniqueViolation {
                    constraint: VIN_CONSTRAINT.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Process-local store with the same constraints as the Postgres schema.
#[derive(Debug, Default)]
pub struct InMemoryListingStore {
    state: Mutex<MemoryState>,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<CanonicalListing> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ListingStore for InMemoryListingStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<CanonicalListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.values().find(|row| row.source_url == url).cloned())
    }

    async fn find_by_vin(&self, vin: &str) -> Result<Option<CanonicalListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .find(|row| row.vin.as_deref() == Some(vin))
            .cloned())
    }

    async fn upsert_by_url(
        &self,
        listing: &CanonicalListing,
    ) -> Result<CanonicalListing, StoreError> {
        let mut state = self.state.lock().await;
        let id = match state.id_for_url(&listing.source_url) {
            Some(id) => id,
            None if state.rows.contains_key(&listing.id) => {
                return Err(StoreError::UniqueViolation {
                    constraint: PRIMARY_KEY_CONSTRAINT.to_string(),
                })
            }
            None => listing.id,
        };
        state.check_unique(listing, id)?;
        let stored = CanonicalListing {
            id,
            ..listing.clone()
        };
        state.rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_by_id(
        &self,
        id: Uuid,
        listing: &CanonicalListing,
    ) -> Result<CanonicalListing, StoreError> {
        let mut state = self.state.lock().await;
        if !state.rows.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        state.check_unique(listing, id)?;
        let stored = CanonicalListing {
            id,
            ..listing.clone()
        };
        state.rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.rows.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        state.associations.remove(&id);
        Ok(())
    }

    async fn replace_option_associations(
        &self,
        listing_id: Uuid,
        option_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.rows.contains_key(&listing_id) {
            return Err(StoreError::NotFound(listing_id));
        }
        let mut ids = option_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        state.associations.insert(listing_id, ids);
        Ok(())
    }

    async fn option_associations(&self, listing_id: Uuid) -> Result<Vec<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .associations
            .get(&listing_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn query(&self, query: &ListingQuery) -> Result<Vec<CanonicalListing>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .rows
            .values()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.sold_date
                .cmp(&a.sold_date)
                .then_with(|| a.source_url.cmp(&b.source_url))
        });
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("options normalizer unavailable: {0}")]
    Unavailable(String),
    #[error("options normalizer quota exhausted")]
    QuotaExhausted,
    #[error("options normalizer timed out after {0:?}")]
    Timeout(Duration),
    #[error("options normalizer returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("options normalizer returned an invalid payload: {0}")]
    InvalidResponse(String),
}

impl TransientError for NormalizerError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            NormalizerError::Unavailable(_)
            | NormalizerError::QuotaExhausted
            | NormalizerError::Timeout(_) => RetryDisposition::Retryable,
            NormalizerError::HttpStatus { status } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            NormalizerError::InvalidResponse(_) => RetryDisposition::NonRetryable,
        }
    }

    fn timed_out(after: Duration) -> Self {
        NormalizerError::Timeout(after)
    }
}

/// External text-understanding collaborator: free-text options -> option names.
#[async_trait]
pub trait TextNormalizer: Send + Sync {
    async fn normalize_options_text(&self, text: &str) -> Result<Vec<String>, NormalizerError>;
}

#[derive(Debug, Clone)]
pub struct NormalizerClientConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
struct NormalizeRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct NormalizeResponse {
    options: Vec<String>,
}

/// JSON-over-HTTP client for a hosted options normalization service.
#[derive(Debug, Clone)]
pub struct HttpTextNormalizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTextNormalizer {
    pub fn new(config: NormalizerClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            api_key: config.api_key,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> NormalizerError {
    if err.is_timeout() {
        NormalizerError::Unavailable(format!("timeout: {err}"))
    } else if err.is_connect() || err.is_request() {
        NormalizerError::Unavailable(err.to_string())
    } else if err.is_decode() {
        NormalizerError::InvalidResponse(err.to_string())
    } else {
        NormalizerError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl TextNormalizer for HttpTextNormalizer {
    async fn normalize_options_text(&self, text: &str) -> Result<Vec<String>, NormalizerError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&NormalizeRequest { text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(NormalizerError::QuotaExhausted);
        }
        if !status.is_success() {
            return Err(NormalizerError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body: NormalizeResponse = resp.json().await.map_err(classify_reqwest_error)?;
        Ok(body.options)
    }
}

/// Offline collaborator: one option per comma, semicolon, pipe, bullet or line.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedTextNormalizer;

#[async_trait]
impl TextNormalizer for DelimitedTextNormalizer {
    async fn normalize_options_text(&self, text: &str) -> Result<Vec<String>, NormalizerError> {
        let mut out: Vec<String> = Vec::new();
        for piece in text.split(|c| matches!(c, ',' | ';' | '\n' | '|' | '•')) {
            let piece = piece
                .trim()
                .trim_start_matches(['-', '*'])
                .trim();
            if piece.is_empty() || out.iter().any(|seen| seen.eq_ignore_ascii_case(piece)) {
                continue;
            }
            out.push(piece.to_string());
        }
        Ok(out)
    }
}
