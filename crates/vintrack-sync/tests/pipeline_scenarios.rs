use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vintrack_core::{CanonicalListing, ListingCandidate, ListingQuery, Provenance, VinConfidence};
use vintrack_enrich::{ListingEnricher, MileagePolicy, OptionsNormalizer, RulesBundle};
use vintrack_storage::{
    BackoffPolicy, DelimitedTextNormalizer, InMemoryListingStore, ListingStore, NormalizerError,
    StoreError, TextNormalizer, VIN_CONSTRAINT,
};
use vintrack_sync::{load_candidates, run_partitioned, ListingError, ListingPipeline, OutcomeKind};

const GT3_RS_VIN: &str = "WP0AC2A90KS149200";
const GT3_VIN: &str = "WP0AC2A9XGS180350";

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn pipeline_with(store: Arc<dyn ListingStore>, text: Arc<dyn TextNormalizer>) -> ListingPipeline {
    let rules = RulesBundle::load(&workspace_root().join("rules")).expect("rules load");
    let options = OptionsNormalizer::new(
        text,
        Arc::new(rules.option_catalog.clone()),
        Arc::new(rules.standard_equipment.clone()),
    )
    .with_retry(fast_retry(), Duration::from_millis(250));
    let enricher = ListingEnricher::new(rules.title_rules, MileagePolicy::default());
    ListingPipeline::new(store, enricher, options).with_retry(fast_retry(), Duration::from_millis(250))
}

fn pipeline(store: Arc<dyn ListingStore>) -> ListingPipeline {
    pipeline_with(store, Arc::new(DelimitedTextNormalizer))
}

fn candidate(source_id: &str, url: &str, vin: Option<&str>, sold: (i32, u32, u32)) -> ListingCandidate {
    ListingCandidate {
        source_id: source_id.into(),
        source_url: url.into(),
        title: "2019 Porsche 911 GT3 RS".into(),
        vin: vin.map(str::to_string),
        year: None,
        price: Some(250_000),
        mileage: Some(3_200),
        exterior_color: None,
        interior_color: None,
        location: None,
        options_text: None,
        sold_date: NaiveDate::from_ymd_opt(sold.0, sold.1, sold.2),
        scraped_at: Utc
            .with_ymd_and_hms(sold.0, sold.1, sold.2, 12, 0, 0)
            .single()
            .unwrap(),
    }
}

fn sample_batch() -> Vec<ListingCandidate> {
    load_candidates(&workspace_root().join("fixtures/sample_batch.json")).expect("fixture")
}

async fn sorted_rows(store: &InMemoryListingStore) -> Vec<CanonicalListing> {
    let mut rows = store.all().await;
    rows.sort_by(|a, b| a.source_url.cmp(&b.source_url));
    rows
}

#[tokio::test]
async fn same_sale_on_two_sources_becomes_one_row_with_filled_color() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline(store.clone());

    let a = candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1));
    let mut b = candidate("cnb", "https://b.example/l/9", Some(GT3_RS_VIN), (2023, 6, 1));
    b.exterior_color = Some("Lizard Green".into());
    b.scraped_at = b.scraped_at + chrono::Duration::hours(3);

    assert_eq!(pipeline.process(a).await.unwrap().kind, OutcomeKind::New);
    assert_eq!(pipeline.process(b).await.unwrap().kind, OutcomeKind::Merged);

    let rows = store.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_url, "https://a.example/l/1");
    assert_eq!(rows[0].exterior_color.as_deref(), Some("Lizard Green"));
}

#[tokio::test]
async fn later_sale_of_the_same_vin_takes_over_the_row() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline(store.clone());

    let first = candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2022, 1, 1));
    let mut second = candidate("pcar", "https://c.example/l/5", Some(GT3_RS_VIN), (2023, 1, 1));
    second.price = Some(272_000);

    pipeline.process(first.clone()).await.unwrap();
    assert_eq!(pipeline.process(second).await.unwrap().kind, OutcomeKind::Relisted);

    let rows = store.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_url, "https://c.example/l/5");
    assert_eq!(rows[0].source_id, "pcar");
    assert_eq!(rows[0].price, Some(272_000));
    assert_eq!(rows[0].sold_date, NaiveDate::from_ymd_opt(2023, 1, 1));

    // The older sale arriving again must not roll the row back.
    assert_eq!(pipeline.process(first).await.unwrap().kind, OutcomeKind::Unchanged);
    let rows = store.all().await;
    assert_eq!(rows[0].source_url, "https://c.example/l/5");
    assert_eq!(rows[0].price, Some(272_000));
}

#[tokio::test]
async fn corrected_price_at_the_same_scrape_time_updates_the_row() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline(store.clone());

    let first = candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1));
    let mut corrected = first.clone();
    corrected.price = Some(260_000);

    assert_eq!(pipeline.process(first).await.unwrap().kind, OutcomeKind::New);
    assert_eq!(pipeline.process(corrected.clone()).await.unwrap().kind, OutcomeKind::Updated);

    let rows = store.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].price, Some(260_000));
    assert_eq!(rows[0].scraped_at, corrected.scraped_at);

    // An older copy of the page still never overwrites.
    let mut stale = corrected;
    stale.price = Some(270_000);
    stale.scraped_at = stale.scraped_at - chrono::Duration::days(1);
    assert_eq!(pipeline.process(stale).await.unwrap().kind, OutcomeKind::Unchanged);
    assert_eq!(store.all().await[0].price, Some(260_000));
}

#[tokio::test]
async fn duplicate_merge_never_replaces_present_fields_with_absent_ones() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline(store.clone());

    let mut a = candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1));
    a.interior_color = Some("Black".into());
    a.location = Some("Austin, TX".into());
    let mut b = candidate("cnb", "https://b.example/l/9", Some(GT3_RS_VIN), (2023, 6, 1));
    b.mileage = None;
    b.price = None;
    b.title = String::new();

    pipeline.process(a).await.unwrap();
    let before = store.all().await;
    pipeline.process(b).await.unwrap();
    let after = store.all().await;

    assert_eq!(after.len(), 1);
    assert_eq!(after[0].interior_color.as_deref(), Some("Black"));
    assert_eq!(after[0].location.as_deref(), Some("Austin, TX"));
    assert_eq!(after[0].mileage, before[0].mileage);
    assert_eq!(after[0].price, Some(250_000));
    assert!(after[0].title.is_some());
}

#[tokio::test]
async fn fixture_batch_resolves_and_reprocessing_is_a_no_op() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline(store.clone());
    let cancel = CancellationToken::new();

    let first = pipeline.run_batch(sample_batch(), &cancel).await;
    assert_eq!(first.total, 7);
    assert_eq!(first.new, 5);
    assert_eq!(first.merged, 1);
    assert_eq!(first.relisted, 1);
    assert_eq!(first.errored, 0);
    assert_eq!(first.unmatched_options.get("Carbon Wing Mirrors"), Some(&1));
    assert_eq!(store.len().await, 5);

    let state = sorted_rows(&store).await;
    let mut associations = Vec::new();
    for row in &state {
        associations.push(store.option_associations(row.id).await.unwrap());
    }

    let second = pipeline.run_batch(sample_batch(), &cancel).await;
    assert_eq!(second.unchanged, 7);
    assert_eq!(sorted_rows(&store).await, state);
    for (row, before) in state.iter().zip(associations) {
        assert_eq!(store.option_associations(row.id).await.unwrap(), before);
    }

    let mut seen = std::collections::HashSet::new();
    for row in &state {
        if let Some(vin) = &row.vin {
            assert!(seen.insert((vin.clone(), row.sold_date)), "duplicate sale row for {vin}");
        }
    }
}

#[tokio::test]
async fn fixture_batch_enrichment_and_options_land_on_rows() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline(store.clone());
    let batch = sample_batch();

    let gt3_rs = pipeline.process(batch[0].clone()).await.unwrap();
    assert_eq!(gt3_rs.vin_confidence, Some(VinConfidence::Medium));
    assert!(gt3_rs.provenance.contains(&("trim", Provenance::TitleInferred)));
    assert!(gt3_rs.provenance.contains(&("generation", Provenance::YearInferred)));
    // PDK is standard on the 991.2 GT3 RS.
    assert_eq!(gt3_rs.options.option_ids(), vec![4, 8, 17]);
    assert!(gt3_rs.associations_written);
    assert_eq!(store.option_associations(gt3_rs.listing_id).await.unwrap(), vec![4, 8, 17]);

    let gt3 = pipeline.process(batch[2].clone()).await.unwrap();
    // PDK is standard on the 991.1 GT3.
    assert_eq!(gt3.options.option_ids(), vec![3, 4, 21]);

    let carrera = pipeline.process(batch[4].clone()).await.unwrap();
    assert_eq!(carrera.vin_confidence, Some(VinConfidence::High));
    assert!(carrera.provenance.contains(&("mileage", Provenance::MileageCorrected)));

    let turbo = pipeline.process(batch[6].clone()).await.unwrap();
    assert_eq!(turbo.vin_confidence, Some(VinConfidence::Invalid));

    let rows = store
        .query(&ListingQuery {
            model: Some("911".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    let carrera_row = rows.iter().find(|r| r.id == carrera.listing_id).unwrap();
    assert_eq!(carrera_row.mileage, Some(21_000));
    assert_eq!(carrera_row.trim.as_deref(), Some("Carrera S"));
    let turbo_row = rows.iter().find(|r| r.id == turbo.listing_id).unwrap();
    assert_eq!(turbo_row.vin, None);
    assert_eq!(turbo_row.trim.as_deref(), Some("Turbo S"));
    assert_eq!(turbo_row.generation.as_deref(), Some("991.2"));
}

#[tokio::test]
async fn partitioned_run_matches_sequential_outcome() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = Arc::new(pipeline(store.clone()));

    let summary = run_partitioned(pipeline, sample_batch(), 4, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.total, 7);
    assert_eq!(summary.processed(), 7);
    assert_eq!(summary.new, 5);
    assert_eq!(summary.merged + summary.relisted, 2);
    assert_eq!(store.len().await, 5);
}

/// Wraps the in-memory store and reports a VIN conflict on the first `failures` writes.
struct ConflictingStore {
    inner: InMemoryListingStore,
    failures: AtomicUsize,
}

impl ConflictingStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryListingStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }

    fn conflict(&self) -> Result<(), StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::UniqueViolation {
                constraint: VIN_CONSTRAINT.into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ListingStore for ConflictingStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<CanonicalListing>, StoreError> {
        self.inner.find_by_url(url).await
    }

    async fn find_by_vin(&self, vin: &str) -> Result<Option<CanonicalListing>, StoreError> {
        self.inner.find_by_vin(vin).await
    }

    async fn upsert_by_url(&self, listing: &CanonicalListing) -> Result<CanonicalListing, StoreError> {
        self.conflict()?;
        self.inner.upsert_by_url(listing).await
    }

    async fn update_by_id(&self, id: Uuid, listing: &CanonicalListing) -> Result<CanonicalListing, StoreError> {
        self.conflict()?;
        self.inner.update_by_id(id, listing).await
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_by_id(id).await
    }

    async fn replace_option_associations(&self, listing_id: Uuid, option_ids: &[i64]) -> Result<(), StoreError> {
        self.inner.replace_option_associations(listing_id, option_ids).await
    }

    async fn option_associations(&self, listing_id: Uuid) -> Result<Vec<i64>, StoreError> {
        self.inner.option_associations(listing_id).await
    }

    async fn query(&self, query: &ListingQuery) -> Result<Vec<CanonicalListing>, StoreError> {
        self.inner.query(query).await
    }
}

#[tokio::test]
async fn first_write_conflict_is_re_resolved_once() {
    let store = Arc::new(ConflictingStore::new(1));
    let pipeline = pipeline(store.clone());

    let outcome = pipeline
        .process(candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1)))
        .await
        .unwrap();
    assert!(outcome.conflict_retried);
    assert_eq!(outcome.kind, OutcomeKind::New);
    assert_eq!(store.inner.len().await, 1);
}

#[tokio::test]
async fn persistent_conflict_errors_the_listing_but_not_the_batch() {
    let store = Arc::new(ConflictingStore::new(2));
    let pipeline = pipeline(store.clone());

    let err = pipeline
        .process(candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ListingError::Conflict(_)));

    let summary = pipeline
        .run_batch(
            vec![
                candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1)),
                candidate("bat", "https://a.example/l/2", Some(GT3_VIN), (2023, 7, 1)),
            ],
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(summary.new, 2);
    assert_eq!(summary.errored, 0);

    let store = Arc::new(ConflictingStore::new(usize::MAX));
    let pipeline = pipeline_with(store.clone(), Arc::new(DelimitedTextNormalizer));
    let summary = pipeline
        .run_batch(
            vec![
                candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1)),
                candidate("bat", "https://a.example/l/2", Some(GT3_VIN), (2023, 7, 1)),
            ],
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(summary.errored, 2);
    assert_eq!(summary.processed(), 2);
    assert!(summary.failures[0].error.contains("conflict"));
}

struct DownNormalizer;

#[async_trait]
impl TextNormalizer for DownNormalizer {
    async fn normalize_options_text(&self, _text: &str) -> Result<Vec<String>, NormalizerError> {
        Err(NormalizerError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn unavailable_normalizer_degrades_options_and_still_persists() {
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline_with(store.clone(), Arc::new(DownNormalizer));

    let mut listing = candidate("bat", "https://a.example/l/1", Some(GT3_RS_VIN), (2023, 6, 1));
    listing.options_text = Some("PDK, Front Axle Lift".into());
    let summary = pipeline.run_batch(vec![listing], &CancellationToken::new()).await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.degraded_options, 1);
    let rows = store.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].options_text.as_deref(), Some("PDK, Front Axle Lift"));
    assert!(store.option_associations(rows[0].id).await.unwrap().is_empty());
}

/// Cancels the batch the first time it is asked to normalize options.
struct CancellingNormalizer {
    cancel: CancellationToken,
}

#[async_trait]
impl TextNormalizer for CancellingNormalizer {
    async fn normalize_options_text(&self, text: &str) -> Result<Vec<String>, NormalizerError> {
        self.cancel.cancel();
        DelimitedTextNormalizer.normalize_options_text(text).await
    }
}

#[tokio::test]
async fn cancelled_batch_finishes_the_current_listing_and_skips_the_rest() {
    let cancel = CancellationToken::new();
    let store = Arc::new(InMemoryListingStore::new());
    let pipeline = pipeline_with(
        store.clone(),
        Arc::new(CancellingNormalizer {
            cancel: cancel.clone(),
        }),
    );

    let summary = pipeline.run_batch(sample_batch(), &cancel).await;
    assert!(summary.cancelled);
    assert_eq!(summary.new, 1);
    assert_eq!(summary.skipped, 6);
    assert_eq!(store.len().await, 1);
}
