//! Listing pipeline orchestration: enrichment, options, resolution and writes.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vintrack_core::{CanonicalListing, ListingCandidate, Provenance, VinConfidence};
use vintrack_enrich::{
    decode, ListingEnricher, MileagePolicy, NormalizedOptions, OptionCatalog, OptionsNormalizer,
    RulesBundle,
};
use vintrack_storage::{
    call_with_retry, BackoffPolicy, DelimitedTextNormalizer, HttpTextNormalizer, ListingStore,
    NormalizerClientConfig, StoreError, TextNormalizer,
};

pub mod export;
pub mod resolution;

pub use export::{export_snapshot, SnapshotManifest, SnapshotManifestFile};
pub use resolution::{merge_listing, resolve, FieldPolicy, ListingField, MergeRule, Resolution};

pub const CRATE_NAME: &str = "vintrack-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub rules_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub normalizer_url: Option<String>,
    pub normalizer_api_key: Option<String>,
    pub call_timeout_secs: u64,
    pub max_retries: usize,
    pub workers: usize,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            rules_dir: PathBuf::from("./rules"),
            reports_dir: PathBuf::from("./reports"),
            normalizer_url: None,
            normalizer_api_key: None,
            call_timeout_secs: 10,
            max_retries: 3,
            workers: 1,
            user_agent: "vintrack/0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            rules_dir: non_empty("VINTRACK_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_dir),
            reports_dir: non_empty("VINTRACK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            normalizer_url: non_empty("VINTRACK_NORMALIZER_URL"),
            normalizer_api_key: non_empty("VINTRACK_NORMALIZER_API_KEY"),
            call_timeout_secs: non_empty("VINTRACK_CALL_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.call_timeout_secs),
            max_retries: non_empty("VINTRACK_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            workers: non_empty("VINTRACK_WORKERS")
                .and_then(|v| v.parse().ok())
                .filter(|w: &usize| *w > 0)
                .unwrap_or(defaults.workers),
            user_agent: non_empty("VINTRACK_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    /// HTTP collaborator when an endpoint is configured, otherwise the offline splitter.
    pub fn text_normalizer(&self) -> Result<Arc<dyn TextNormalizer>> {
        match &self.normalizer_url {
            Some(endpoint) => {
                let client = HttpTextNormalizer::new(NormalizerClientConfig {
                    endpoint: endpoint.clone(),
                    api_key: self.normalizer_api_key.clone(),
                    timeout: self.call_timeout(),
                    user_agent: Some(self.user_agent.clone()),
                })?;
                Ok(Arc::new(client))
            }
            None => Ok(Arc::new(DelimitedTextNormalizer)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    New,
    Updated,
    Unchanged,
    Merged,
    Relisted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingOutcome {
    pub source_url: String,
    pub kind: OutcomeKind,
    /// Canonical row the listing resolved to.
    pub listing_id: Uuid,
    pub vin_confidence: Option<VinConfidence>,
    pub provenance: Vec<(&'static str, Provenance)>,
    pub options: NormalizedOptions,
    pub associations_written: bool,
    pub conflict_retried: bool,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing has no source url")]
    MissingSourceUrl,
    #[error("uniqueness conflict persisted after re-resolution: {0}")]
    Conflict(StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingFailure {
    pub source_url: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub merged: usize,
    pub relisted: usize,
    pub errored: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub degraded_options: usize,
    /// Unmatched option name -> occurrences.
    pub unmatched_options: BTreeMap<String, usize>,
    pub failures: Vec<ListingFailure>,
}

impl BatchSummary {
    pub fn new(run_id: Uuid, total: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            total,
            new: 0,
            updated: 0,
            unchanged: 0,
            merged: 0,
            relisted: 0,
            errored: 0,
            skipped: 0,
            cancelled: false,
            degraded_options: 0,
            unmatched_options: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, source_url: &str, result: &Result<ListingOutcome, ListingError>) {
        match result {
            Ok(outcome) => {
                match outcome.kind {
                    OutcomeKind::New => self.new += 1,
                    OutcomeKind::Updated => self.updated += 1,
                    OutcomeKind::Unchanged => self.unchanged += 1,
                    OutcomeKind::Merged => self.merged += 1,
                    OutcomeKind::Relisted => self.relisted += 1,
                }
                if outcome.options.degraded {
                    self.degraded_options += 1;
                }
                for unmatched in &outcome.options.unmatched {
                    *self
                        .unmatched_options
                        .entry(unmatched.name.clone())
                        .or_default() += 1;
                }
            }
            Err(err) => {
                self.errored += 1;
                self.failures.push(ListingFailure {
                    source_url: source_url.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    pub fn absorb(&mut self, other: BatchSummary) {
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.merged += other.merged;
        self.relisted += other.relisted;
        self.errored += other.errored;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
        self.degraded_options += other.degraded_options;
        for (name, count) in other.unmatched_options {
            *self.unmatched_options.entry(name).or_default() += count;
        }
        self.failures.extend(other.failures);
    }

    pub fn processed(&self) -> usize {
        self.new + self.updated + self.unchanged + self.merged + self.relisted + self.errored
    }
}

/// Per-listing processing against one persistence facade.
pub struct ListingPipeline {
    store: Arc<dyn ListingStore>,
    enricher: ListingEnricher,
    options: OptionsNormalizer,
    backoff: BackoffPolicy,
    call_timeout: Duration,
}

impl ListingPipeline {
    pub fn new(
        store: Arc<dyn ListingStore>,
        enricher: ListingEnricher,
        options: OptionsNormalizer,
    ) -> Self {
        Self {
            store,
            enricher,
            options,
            backoff: BackoffPolicy::default(),
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retry(mut self, backoff: BackoffPolicy, call_timeout: Duration) -> Self {
        self.backoff = backoff;
        self.call_timeout = call_timeout;
        self
    }

    /// Wires rules from `config.rules_dir`, the configured text normalizer and
    /// the given catalog. `catalog` overrides the YAML catalog when provided.
    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<dyn ListingStore>,
        catalog: Option<Arc<dyn OptionCatalog>>,
    ) -> Result<Self> {
        let rules = RulesBundle::load(&config.rules_dir)?;
        let catalog = catalog.unwrap_or_else(|| Arc::new(rules.option_catalog.clone()));
        let options = OptionsNormalizer::new(
            config.text_normalizer()?,
            catalog,
            Arc::new(rules.standard_equipment.clone()),
        )
        .with_retry(config.backoff(), config.call_timeout());
        let enricher = ListingEnricher::new(rules.title_rules, MileagePolicy::default());
        Ok(Self::new(store, enricher, options).with_retry(config.backoff(), config.call_timeout()))
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    async fn store_call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        call_with_retry(&self.backoff, self.call_timeout, operation, call).await
    }

    pub async fn process(&self, candidate: ListingCandidate) -> Result<ListingOutcome, ListingError> {
        let span = info_span!(
            "listing",
            source = %candidate.source_id,
            url = %candidate.source_url
        );
        self.process_inner(candidate).instrument(span).await
    }

    async fn process_inner(&self, candidate: ListingCandidate) -> Result<ListingOutcome, ListingError> {
        let candidate = candidate.normalized();
        if candidate.source_url.is_empty() {
            return Err(ListingError::MissingSourceUrl);
        }

        let decoded = candidate.vin.as_deref().map(decode);
        let enriched = self.enricher.enrich(candidate, decoded.as_ref());
        let options = self.options.canonicalize(&enriched).await;
        let incoming = enriched.to_canonical(Uuid::new_v4());

        let mut conflict_retried = false;
        let (kind, row) = loop {
            let by_url = self
                .store_call("find_by_url", || self.store.find_by_url(&incoming.source_url))
                .await?;
            let by_vin = match incoming.vin.as_deref() {
                Some(vin) => self.store_call("find_by_vin", || self.store.find_by_vin(vin)).await?,
                None => None,
            };

            let resolution = resolve(&incoming, by_url, by_vin);
            debug!(resolution = resolution.kind(), "resolved");
            match self.apply(resolution).await {
                Ok(applied) => break applied,
                Err(err) if err.is_unique_violation() && !conflict_retried => {
                    warn!(error = %err, "write conflict, re-resolving once");
                    conflict_retried = true;
                }
                Err(err) if err.is_unique_violation() => return Err(ListingError::Conflict(err)),
                Err(err) => return Err(ListingError::Store(err)),
            }
        };

        let associations_written = self
            .sync_associations(&row, &options, incoming.options_text.as_deref())
            .await;

        info!(
            outcome = ?kind,
            listing_id = %row.id,
            matched_options = options.matched.len(),
            degraded = options.degraded,
            "listing processed"
        );
        Ok(ListingOutcome {
            source_url: incoming.source_url.clone(),
            kind,
            listing_id: row.id,
            vin_confidence: enriched.vin_confidence,
            provenance: enriched.provenance_tags(),
            options,
            associations_written,
            conflict_retried,
        })
    }

    /// Executes a decided resolution. Rows that merge to themselves are not written.
    async fn apply(&self, resolution: Resolution) -> Result<(OutcomeKind, CanonicalListing), StoreError> {
        match resolution {
            Resolution::New { listing } => {
                let row = self
                    .store_call("upsert_by_url", || self.store.upsert_by_url(&listing))
                    .await?;
                Ok((OutcomeKind::New, row))
            }
            Resolution::Update {
                existing,
                merged,
                vin_conflict,
            } => {
                if let Some(owner) = vin_conflict {
                    warn!(%owner, "vin belongs to another sale; row keeps its own vin");
                }
                if merged == existing {
                    return Ok((OutcomeKind::Unchanged, existing));
                }
                let row = self
                    .store_call("update_by_id", || self.store.update_by_id(existing.id, &merged))
                    .await?;
                Ok((OutcomeKind::Updated, row))
            }
            Resolution::DuplicateMerge {
                target,
                merged,
                absorbed,
            } => {
                let changed = merged != target;
                let row = if changed {
                    self.store_call("update_by_id", || self.store.update_by_id(target.id, &merged))
                        .await?
                } else {
                    target
                };
                if let Some(absorbed) = &absorbed {
                    self.store_call("delete_by_id", || self.store.delete_by_id(absorbed.id))
                        .await?;
                    info!(absorbed = %absorbed.id, into = %row.id, "duplicate row absorbed");
                }
                let kind = if changed || absorbed.is_some() {
                    OutcomeKind::Merged
                } else {
                    OutcomeKind::Unchanged
                };
                Ok((kind, row))
            }
            Resolution::Relist {
                target,
                merged,
                historical,
            } => {
                if merged == target {
                    return Ok((OutcomeKind::Unchanged, target));
                }
                if historical {
                    debug!("older sale; filling gaps only");
                }
                let row = self
                    .store_call("update_by_id", || self.store.update_by_id(target.id, &merged))
                    .await?;
                Ok((OutcomeKind::Relisted, row))
            }
        }
    }

    /// Replaces the row's option set when it was derived from the text the row now holds.
    /// Failures are logged and skipped.
    async fn sync_associations(
        &self,
        row: &CanonicalListing,
        options: &NormalizedOptions,
        incoming_text: Option<&str>,
    ) -> bool {
        if options.degraded || incoming_text.is_none() || row.options_text.as_deref() != incoming_text {
            return false;
        }
        let desired = options.option_ids();
        let result = async {
            let current = self
                .store_call("option_associations", || self.store.option_associations(row.id))
                .await?;
            if current == desired {
                return Ok(false);
            }
            self.store_call("replace_option_associations", || {
                self.store.replace_option_associations(row.id, &desired)
            })
            .await?;
            Ok::<_, StoreError>(true)
        }
        .await;

        match result {
            Ok(written) => written,
            Err(err) => {
                warn!(error = %err, listing_id = %row.id, "option association write skipped");
                false
            }
        }
    }

    /// Processes listings in order, stopping between listings once `cancel` fires.
    pub async fn run_batch(
        &self,
        candidates: Vec<ListingCandidate>,
        cancel: &CancellationToken,
    ) -> BatchSummary {
        let mut summary = BatchSummary::new(Uuid::new_v4(), candidates.len());
        for (index, candidate) in candidates.into_iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                summary.skipped = summary.total - index;
                warn!(skipped = summary.skipped, "batch cancelled");
                break;
            }
            let source_url = candidate.source_url.clone();
            let result = self.process(candidate).await;
            if let Err(err) = &result {
                warn!(url = %source_url, error = %err, "listing failed");
            }
            summary.record(&source_url, &result);
        }
        summary.finished_at = Utc::now();
        summary
    }
}

/// Stable worker index: listings that can resolve to the same row share a partition.
pub fn partition_for(candidate: &ListingCandidate, partitions: usize) -> usize {
    let normalized = candidate.clone().normalized();
    let key = normalized
        .vin
        .filter(|v| vintrack_core::is_vin_shaped(v))
        .unwrap_or(normalized.source_url);
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions.max(1) as u64) as usize
}

/// Runs VIN-partitioned batches as independent tasks and folds their summaries.
pub async fn run_partitioned(
    pipeline: Arc<ListingPipeline>,
    candidates: Vec<ListingCandidate>,
    workers: usize,
    cancel: CancellationToken,
) -> Result<BatchSummary> {
    let workers = workers.max(1);
    let mut summary = BatchSummary::new(Uuid::new_v4(), candidates.len());
    if workers == 1 {
        let single = pipeline.run_batch(candidates, &cancel).await;
        summary.absorb(single);
        summary.finished_at = Utc::now();
        return Ok(summary);
    }

    let mut partitions: Vec<Vec<ListingCandidate>> = vec![Vec::new(); workers];
    for candidate in candidates {
        let index = partition_for(&candidate, workers);
        partitions[index].push(candidate);
    }

    let mut tasks = JoinSet::new();
    for (worker, partition) in partitions.into_iter().enumerate() {
        if partition.is_empty() {
            continue;
        }
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tasks.spawn(
            async move { pipeline.run_batch(partition, &cancel).await }
                .instrument(info_span!("partition", worker)),
        );
    }

    while let Some(joined) = tasks.join_next().await {
        let part = joined.context("partition task failed")?;
        summary.absorb(part);
    }
    summary.finished_at = Utc::now();
    Ok(summary)
}

/// Reads a JSON array of listing candidates.
pub fn load_candidates(path: &Path) -> Result<Vec<ListingCandidate>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Writes `batch_summary.json`, `unmatched_options.json` and `batch_brief.md`
/// under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &BatchSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing batch summary")?;
    fs::write(reports_dir.join("batch_summary.json"), summary_json)
        .await
        .context("writing batch_summary.json")?;

    let mut unmatched: Vec<(&String, &usize)> = summary.unmatched_options.iter().collect();
    unmatched.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let unmatched_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": summary.run_id,
        "unmatched": unmatched
            .iter()
            .map(|(name, count)| serde_json::json!({ "name": name, "count": count }))
            .collect::<Vec<_>>(),
    }))
    .context("serializing unmatched options")?;
    fs::write(reports_dir.join("unmatched_options.json"), unmatched_json)
        .await
        .context("writing unmatched_options.json")?;

    let brief = format!(
        "# Listing Batch Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Listings: {}\n- Cancelled: {}\n\n## Outcomes\n- new: {}\n- updated: {}\n- unchanged: {}\n- merged: {}\n- relisted: {}\n- errored: {}\n- skipped: {}\n- degraded options: {}\n\n## Unmatched Options\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.total,
        summary.cancelled,
        summary.new,
        summary.updated,
        summary.unchanged,
        summary.merged,
        summary.relisted,
        summary.errored,
        summary.skipped,
        summary.degraded_options,
        if unmatched.is_empty() {
            "- none".to_string()
        } else {
            unmatched
                .iter()
                .map(|(name, count)| format!("- {name}: {count}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    );
    fs::write(reports_dir.join("batch_brief.md"), brief)
        .await
        .context("writing batch_brief.md")?;

    Ok(reports_dir)
}
