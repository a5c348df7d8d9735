//! Parquet snapshot of the canonical dataset for analytics consumers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use vintrack_core::{CanonicalListing, ListingQuery};
use vintrack_storage::ListingStore;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `canonical_listings.parquet` and `listing_options.parquet` plus
/// `manifest.json` into `out_dir`, returning the manifest path.
pub async fn export_snapshot(store: &dyn ListingStore, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let listings = store
        .query(&ListingQuery::default())
        .await
        .context("reading canonical listings")?;
    let mut associations = Vec::new();
    for listing in &listings {
        let ids = store
            .option_associations(listing.id)
            .await
            .with_context(|| format!("reading options of {}", listing.id))?;
        associations.extend(ids.into_iter().map(|option_id| (listing.id.to_string(), option_id)));
    }

    let listings_path = out_dir.join("canonical_listings.parquet");
    let options_path = out_dir.join("listing_options.parquet");
    write_listings_parquet(&listings_path, &listings)?;
    write_options_parquet(&options_path, &associations)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        rows: listings.len(),
        files: vec![
            manifest_entry("canonical_listings", out_dir, &listings_path)?,
            manifest_entry("listing_options", out_dir, &options_path)?,
        ],
    };

    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(rows = listings.len(), path = %manifest_path.display(), "snapshot exported");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_column<'a>(
    rows: &'a [CanonicalListing],
    get: impl Fn(&'a CanonicalListing) -> Option<&'a str>,
) -> StringArray {
    StringArray::from(rows.iter().map(get).collect::<Vec<_>>())
}

fn write_listings_parquet(path: &Path, rows: &[CanonicalListing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("vin", DataType::Utf8, true),
        ArrowField::new("model_year", DataType::Int32, true),
        ArrowField::new("model", DataType::Utf8, true),
        ArrowField::new("trim", DataType::Utf8, true),
        ArrowField::new("generation", DataType::Utf8, true),
        ArrowField::new("price", DataType::Int64, true),
        ArrowField::new("mileage", DataType::Int64, true),
        ArrowField::new("exterior_color", DataType::Utf8, true),
        ArrowField::new("interior_color", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("sold_date", DataType::Utf8, true),
        ArrowField::new("scraped_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(rows.iter().map(|r| Some(r.id.to_string())).collect::<Vec<_>>());
    let sold_dates = StringArray::from(
        rows.iter()
            .map(|r| r.sold_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let scraped_at = StringArray::from(
        rows.iter()
            .map(|r| Some(r.scraped_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(text_column(rows, |r| Some(r.source_id.as_str()))),
            Arc::new(text_column(rows, |r| Some(r.source_url.as_str()))),
            Arc::new(text_column(rows, |r| r.vin.as_deref())),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.year).collect::<Vec<_>>())),
            Arc::new(text_column(rows, |r| r.model.as_deref())),
            Arc::new(text_column(rows, |r| r.trim.as_deref())),
            Arc::new(text_column(rows, |r| r.generation.as_deref())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.price).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.mileage).collect::<Vec<_>>())),
            Arc::new(text_column(rows, |r| r.exterior_color.as_deref())),
            Arc::new(text_column(rows, |r| r.interior_color.as_deref())),
            Arc::new(text_column(rows, |r| r.location.as_deref())),
            Arc::new(text_column(rows, |r| r.title.as_deref())),
            Arc::new(sold_dates),
            Arc::new(scraped_at),
        ],
    )
    .context("building canonical_listings record batch")?;
    write_parquet(path, batch)
}

fn write_options_parquet(path: &Path, rows: &[(String, i64)]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_id", DataType::Utf8, false),
        ArrowField::new("option_id", DataType::Int64, false),
    ]));
    let listing_ids = StringArray::from(rows.iter().map(|(id, _)| Some(id.as_str())).collect::<Vec<_>>());
    let option_ids = Int64Array::from(rows.iter().map(|(_, option)| *option).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(listing_ids), Arc::new(option_ids)])
        .context("building listing_options record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
