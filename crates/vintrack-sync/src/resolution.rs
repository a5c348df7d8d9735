//! Identity resolution: which canonical row an incoming listing belongs to, and
//! the record that results from merging it in.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;
use vintrack_core::CanonicalListing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingField {
    SourceId,
    SourceUrl,
    Vin,
    Year,
    Model,
    Trim,
    Generation,
    Price,
    Mileage,
    ExteriorColor,
    InteriorColor,
    Location,
    Title,
    OptionsText,
    SoldDate,
    ScrapedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeRule {
    /// Existing value stays even when absent.
    KeepExisting,
    /// Existing value unless absent.
    FillMissing,
    /// Incoming value unless absent.
    PreferIncoming,
    /// Greater of the two present values.
    Latest,
}

/// Per-field merge rules; fields not listed use `default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    pub name: &'static str,
    pub default: MergeRule,
    pub rules: BTreeMap<ListingField, MergeRule>,
}

impl FieldPolicy {
    fn with(name: &'static str, default: MergeRule, rules: &[(ListingField, MergeRule)]) -> Self {
        Self {
            name,
            default,
            rules: rules.iter().copied().collect(),
        }
    }

    pub fn rule_for(&self, field: ListingField) -> MergeRule {
        self.rules.get(&field).copied().unwrap_or(self.default)
    }

    /// Re-scrape of a known URL: mutable fields follow the page.
    pub fn update() -> Self {
        use ListingField::*;
        use MergeRule::*;
        Self::with(
            "update",
            FillMissing,
            &[
                (SourceId, KeepExisting),
                (SourceUrl, KeepExisting),
                (Price, PreferIncoming),
                (Mileage, PreferIncoming),
                (ExteriorColor, PreferIncoming),
                (InteriorColor, PreferIncoming),
                (OptionsText, PreferIncoming),
                (SoldDate, PreferIncoming),
                (ScrapedAt, Latest),
            ],
        )
    }

    /// Re-scrape carrying the row's own timestamp: the sale fields follow the
    /// page, everything else only fills gaps. A relist may have written the
    /// row from this same scrape with fill-only mileage, colors and options.
    pub fn same_scrape() -> Self {
        use ListingField::*;
        use MergeRule::*;
        Self::with(
            "same-scrape",
            FillMissing,
            &[
                (SourceId, KeepExisting),
                (SourceUrl, KeepExisting),
                (Price, PreferIncoming),
                (SoldDate, PreferIncoming),
                (ScrapedAt, Latest),
            ],
        )
    }

    /// Re-scrape older than the row's last write: fill-only.
    pub fn stale_update() -> Self {
        Self {
            name: "stale-update",
            ..Self::duplicate_merge()
        }
    }

    /// Second representation of the same sale: fill-only.
    pub fn duplicate_merge() -> Self {
        use ListingField::*;
        use MergeRule::*;
        Self::with(
            "duplicate-merge",
            FillMissing,
            &[
                (SourceId, KeepExisting),
                (SourceUrl, KeepExisting),
                (ScrapedAt, Latest),
            ],
        )
    }

    /// Later sale of the same vehicle: the row moves to the new sale event.
    pub fn relist() -> Self {
        use ListingField::*;
        use MergeRule::*;
        Self::with(
            "relist",
            FillMissing,
            &[
                (SourceId, PreferIncoming),
                (SourceUrl, PreferIncoming),
                (Price, PreferIncoming),
                (SoldDate, PreferIncoming),
                (ScrapedAt, Latest),
            ],
        )
    }

    /// Earlier sale seen after a later one: fill gaps, never roll back.
    pub fn historical() -> Self {
        use ListingField::*;
        use MergeRule::*;
        Self::with(
            "historical",
            FillMissing,
            &[
                (SourceId, KeepExisting),
                (SourceUrl, KeepExisting),
                (Price, KeepExisting),
                (SoldDate, KeepExisting),
                (ScrapedAt, Latest),
            ],
        )
    }
}

fn merge_optional<T: Clone + Ord>(rule: MergeRule, existing: &Option<T>, incoming: &Option<T>) -> Option<T> {
    match rule {
        MergeRule::KeepExisting => existing.clone(),
        MergeRule::FillMissing => existing.clone().or_else(|| incoming.clone()),
        MergeRule::PreferIncoming => incoming.clone().or_else(|| existing.clone()),
        MergeRule::Latest => existing.clone().max(incoming.clone()),
    }
}

fn merge_required<T: Clone + Ord>(rule: MergeRule, existing: &T, incoming: &T) -> T {
    match rule {
        MergeRule::KeepExisting | MergeRule::FillMissing => existing.clone(),
        MergeRule::PreferIncoming => incoming.clone(),
        MergeRule::Latest => existing.max(incoming).clone(),
    }
}

/// Applies `policy` field by field. The result keeps the existing row's id.
pub fn merge_listing(
    existing: &CanonicalListing,
    incoming: &CanonicalListing,
    policy: &FieldPolicy,
) -> CanonicalListing {
    use ListingField as F;
    let opt = |field: ListingField, e: &Option<String>, i: &Option<String>| {
        merge_optional(policy.rule_for(field), e, i)
    };

    CanonicalListing {
        id: existing.id,
        source_id: merge_required(policy.rule_for(F::SourceId), &existing.source_id, &incoming.source_id),
        source_url: merge_required(policy.rule_for(F::SourceUrl), &existing.source_url, &incoming.source_url),
        vin: opt(F::Vin, &existing.vin, &incoming.vin),
        year: merge_optional(policy.rule_for(F::Year), &existing.year, &incoming.year),
        model: opt(F::Model, &existing.model, &incoming.model),
        trim: opt(F::Trim, &existing.trim, &incoming.trim),
        generation: opt(F::Generation, &existing.generation, &incoming.generation),
        price: merge_optional(policy.rule_for(F::Price), &existing.price, &incoming.price),
        mileage: merge_optional(policy.rule_for(F::Mileage), &existing.mileage, &incoming.mileage),
        exterior_color: opt(F::ExteriorColor, &existing.exterior_color, &incoming.exterior_color),
        interior_color: opt(F::InteriorColor, &existing.interior_color, &incoming.interior_color),
        location: opt(F::Location, &existing.location, &incoming.location),
        title: opt(F::Title, &existing.title, &incoming.title),
        options_text: opt(F::OptionsText, &existing.options_text, &incoming.options_text),
        sold_date: merge_optional(policy.rule_for(F::SoldDate), &existing.sold_date, &incoming.sold_date),
        scraped_at: merge_required(policy.rule_for(F::ScrapedAt), &existing.scraped_at, &incoming.scraped_at),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    New {
        listing: CanonicalListing,
    },
    Update {
        existing: CanonicalListing,
        merged: CanonicalListing,
        /// Row that already owns the incoming VIN for another sale.
        vin_conflict: Option<Uuid>,
    },
    DuplicateMerge {
        target: CanonicalListing,
        merged: CanonicalListing,
        /// URL row found to duplicate `target`; deleted once merged.
        absorbed: Option<CanonicalListing>,
    },
    Relist {
        target: CanonicalListing,
        merged: CanonicalListing,
        historical: bool,
    },
}

impl Resolution {
    pub fn kind(&self) -> &'static str {
        match self {
            Resolution::New { .. } => "new",
            Resolution::Update { .. } => "update",
            Resolution::DuplicateMerge { .. } => "duplicate-merge",
            Resolution::Relist { .. } => "relist",
        }
    }
}

/// Same physical sale: both sides sold on the same calendar day.
pub fn same_sale(a: &CanonicalListing, b: &CanonicalListing) -> bool {
    matches!((a.sold_date, b.sold_date), (Some(x), Some(y)) if x == y)
}

/// Decides the action for `incoming` given the rows found by URL and by VIN.
pub fn resolve(
    incoming: &CanonicalListing,
    by_url: Option<CanonicalListing>,
    by_vin: Option<CanonicalListing>,
) -> Resolution {
    match by_url {
        Some(url_row) => {
            let vin_row = by_vin.filter(|row| row.id != url_row.id);
            let policy = match incoming.scraped_at.cmp(&url_row.scraped_at) {
                Ordering::Greater => FieldPolicy::update(),
                Ordering::Equal => FieldPolicy::same_scrape(),
                Ordering::Less => FieldPolicy::stale_update(),
            };
            let updated = merge_listing(&url_row, incoming, &policy);

            match vin_row {
                Some(vin_row) if same_sale(&vin_row, &updated) => {
                    let merged = merge_listing(&vin_row, &updated, &FieldPolicy::duplicate_merge());
                    Resolution::DuplicateMerge {
                        target: vin_row,
                        merged,
                        absorbed: Some(url_row),
                    }
                }
                Some(vin_row) => {
                    let merged = CanonicalListing {
                        vin: url_row.vin.clone(),
                        ..updated
                    };
                    Resolution::Update {
                        existing: url_row,
                        merged,
                        vin_conflict: Some(vin_row.id),
                    }
                }
                None => Resolution::Update {
                    existing: url_row,
                    merged: updated,
                    vin_conflict: None,
                },
            }
        }
        None => match by_vin {
            Some(vin_row) if same_sale(&vin_row, incoming) => {
                let merged = merge_listing(&vin_row, incoming, &FieldPolicy::duplicate_merge());
                Resolution::DuplicateMerge {
                    target: vin_row,
                    merged,
                    absorbed: None,
                }
            }
            Some(vin_row) => {
                // Without two sold dates, scrape order decides which sale is older.
                let historical = match (incoming.sold_date, vin_row.sold_date) {
                    (Some(new), Some(old)) => new < old,
                    _ => incoming.scraped_at < vin_row.scraped_at,
                };
                let policy = if historical {
                    FieldPolicy::historical()
                } else {
                    FieldPolicy::relist()
                };
                let merged = merge_listing(&vin_row, incoming, &policy);
                Resolution::Relist {
                    target: vin_row,
                    merged,
                    historical,
                }
            }
            None => Resolution::New {
                listing: incoming.clone(),
            },
        },
    }
}
