//! Core domain model and provenance types for vintrack.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vintrack-core";

/// Mechanism that produced an enriched field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Reported,
    VinDecoded,
    TitleInferred,
    YearInferred,
    MileageCorrected,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Reported => "reported",
            Provenance::VinDecoded => "vin-decoded",
            Provenance::TitleInferred => "title-inferred",
            Provenance::YearInferred => "year-inferred",
            Provenance::MileageCorrected => "mileage-corrected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VinConfidence {
    High,
    Medium,
    Low,
    Invalid,
}

impl VinConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            VinConfidence::High => "high",
            VinConfidence::Medium => "medium",
            VinConfidence::Low => "low",
            VinConfidence::Invalid => "invalid",
        }
    }
}

/// Enriched field wrapper with optional value + provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value_and_provenance(value: T, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Sets the value only when the field is still empty. Returns whether it was filled.
    pub fn fill(&mut self, value: Option<T>, provenance: Provenance) -> bool {
        if self.value.is_some() {
            return false;
        }
        match value {
            Some(value) => {
                self.value = Some(value);
                self.provenance = Some(provenance);
                true
            }
            None => false,
        }
    }

    pub fn replace(&mut self, value: T, provenance: Provenance) {
        self.value = Some(value);
        self.provenance = Some(provenance);
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.provenance = None;
    }
}

impl<T: Clone> Field<T> {
    pub fn cloned_value(&self) -> Option<T> {
        self.value.clone()
    }
}

/// Parsed handoff contract from the scraping layer into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub source_id: String,
    pub source_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub mileage: Option<i64>,
    #[serde(default)]
    pub exterior_color: Option<String>,
    #[serde(default)]
    pub interior_color: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub options_text: Option<String>,
    #[serde(default)]
    pub sold_date: Option<NaiveDate>,
    pub scraped_at: DateTime<Utc>,
}

impl ListingCandidate {
    /// Blank text becomes absent and the VIN is reduced to its canonical spelling.
    pub fn normalized(mut self) -> Self {
        self.source_id = self.source_id.trim().to_string();
        self.source_url = self.source_url.trim().to_string();
        self.title = self.title.split_whitespace().collect::<Vec<_>>().join(" ");
        self.vin = self.vin.as_deref().and_then(normalize_vin);
        self.exterior_color = self.exterior_color.and_then(text_or_none);
        self.interior_color = self.interior_color.and_then(text_or_none);
        self.location = self.location.and_then(text_or_none);
        self.options_text = self.options_text.and_then(text_or_none);
        self
    }

    /// Year used as "now" when judging vehicle age.
    pub fn reference_year(&self) -> i32 {
        use chrono::Datelike;
        self.sold_date
            .map(|d| d.year())
            .unwrap_or_else(|| self.scraped_at.year())
    }
}

/// Candidate after VIN decoding and field inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedListing {
    pub candidate: ListingCandidate,
    /// VIN usable as an identity key; absent when missing or not VIN-shaped.
    pub vin: Option<String>,
    pub vin_confidence: Option<VinConfidence>,
    pub year: Field<i32>,
    pub model: Field<String>,
    pub trim: Field<String>,
    pub generation: Field<String>,
    pub mileage: Field<i64>,
    #[serde(default)]
    pub audit: Vec<String>,
}

impl EnrichedListing {
    pub fn provenance_tags(&self) -> Vec<(&'static str, Provenance)> {
        let mut tags = Vec::new();
        let mut push = |name: &'static str, provenance: Option<Provenance>| {
            if let Some(p) = provenance {
                tags.push((name, p));
            }
        };
        push("year", self.year.provenance);
        push("model", self.model.provenance);
        push("trim", self.trim.provenance);
        push("generation", self.generation.provenance);
        push("mileage", self.mileage.provenance);
        tags
    }

    pub fn to_canonical(&self, id: Uuid) -> CanonicalListing {
        let c = &self.candidate;
        CanonicalListing {
            id,
            source_id: c.source_id.clone(),
            source_url: c.source_url.clone(),
            vin: self.vin.clone(),
            year: self.year.cloned_value(),
            model: self.model.cloned_value(),
            trim: self.trim.cloned_value(),
            generation: self.generation.cloned_value(),
            price: c.price,
            mileage: self.mileage.cloned_value(),
            exterior_color: c.exterior_color.clone(),
            interior_color: c.interior_color.clone(),
            location: c.location.clone(),
            title: text_or_none(c.title.clone()),
            options_text: c.options_text.clone(),
            sold_date: c.sold_date,
            scraped_at: c.scraped_at,
        }
    }
}

/// Canonical persisted listing; one row per source URL, VIN unique when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub id: Uuid,
    pub source_id: String,
    pub source_url: String,
    pub vin: Option<String>,
    pub year: Option<i32>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub generation: Option<String>,
    pub price: Option<i64>,
    pub mileage: Option<i64>,
    pub exterior_color: Option<String>,
    pub interior_color: Option<String>,
    pub location: Option<String>,
    pub title: Option<String>,
    pub options_text: Option<String>,
    pub sold_date: Option<NaiveDate>,
    pub scraped_at: DateTime<Utc>,
}

/// Entry of the externally curated option catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogOption {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Features included in the base price of a model/trim configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardEquipmentRule {
    pub model: String,
    pub trim: String,
    #[serde(default)]
    pub generation: Option<String>,
    #[serde(default)]
    pub year_from: Option<i32>,
    #[serde(default)]
    pub year_to: Option<i32>,
    pub features: Vec<String>,
}

/// Analytics-side filter over canonical rows. Unset members match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub vin: Option<String>,
    pub source_id: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub generation: Option<String>,
    pub sold_from: Option<NaiveDate>,
    pub sold_to: Option<NaiveDate>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub limit: Option<usize>,
}

impl ListingQuery {
    pub fn matches(&self, listing: &CanonicalListing) -> bool {
        fn eq_ci(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                None => true,
                Some(f) => value.as_deref().is_some_and(|v| v.eq_ignore_ascii_case(f)),
            }
        }

        eq_ci(&self.vin, &listing.vin)
            && self
                .source_id
                .as_deref()
                .map_or(true, |s| s == listing.source_id)
            && eq_ci(&self.model, &listing.model)
            && eq_ci(&self.trim, &listing.trim)
            && eq_ci(&self.generation, &listing.generation)
            && self
                .sold_from
                .map_or(true, |from| listing.sold_date.is_some_and(|d| d >= from))
            && self
                .sold_to
                .map_or(true, |to| listing.sold_date.is_some_and(|d| d <= to))
            && self
                .price_min
                .map_or(true, |min| listing.price.is_some_and(|p| p >= min))
            && self
                .price_max
                .map_or(true, |max| listing.price.is_some_and(|p| p <= max))
    }
}

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Case-folded, punctuation-insensitive, whitespace-collapsed comparison key.
pub fn comparison_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Upper-cases and strips separators. Empty input yields `None`.
pub fn normalize_vin(raw: &str) -> Option<String> {
    let vin: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if vin.is_empty() {
        None
    } else {
        Some(vin)
    }
}

/// 17 characters from the VIN alphabet (no I, O, Q).
pub fn is_vin_shaped(vin: &str) -> bool {
    vin.len() == 17
        && vin
            .chars()
            .all(|c| c.is_ascii_digit() || (c.is_ascii_uppercase() && !matches!(c, 'I' | 'O' | 'Q')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate() -> ListingCandidate {
        ListingCandidate {
            source_id: " bat ".into(),
            source_url: "https://example.com/listing/1 ".into(),
            title: "  2019   Porsche 911 GT3 RS ".into(),
            vin: Some(" wp0ac2a9-0ks149200 ".into()),
            year: None,
            price: Some(210_000),
            mileage: Some(4_100),
            exterior_color: Some("   ".into()),
            interior_color: Some(" Black ".into()),
            location: None,
            options_text: Some("".into()),
            sold_date: NaiveDate::from_ymd_opt(2023, 6, 1),
            scraped_at: Utc.with_ymd_and_hms(2023, 6, 2, 8, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn normalization_drops_blank_text_and_canonicalizes_vin() {
        let c = candidate().normalized();
        assert_eq!(c.source_id, "bat");
        assert_eq!(c.title, "2019 Porsche 911 GT3 RS");
        assert_eq!(c.vin.as_deref(), Some("WP0AC2A90KS149200"));
        assert_eq!(c.exterior_color, None);
        assert_eq!(c.interior_color.as_deref(), Some("Black"));
        assert_eq!(c.options_text, None);
        assert_eq!(c.reference_year(), 2023);
    }

    #[test]
    fn field_fill_never_overwrites() {
        let mut field = Field::with_value_and_provenance(2019, Provenance::VinDecoded);
        assert!(!field.fill(Some(2018), Provenance::TitleInferred));
        assert_eq!(field.value(), Some(&2019));
        assert_eq!(field.provenance, Some(Provenance::VinDecoded));

        let mut empty: Field<i32> = Field::empty();
        assert!(!empty.fill(None, Provenance::TitleInferred));
        assert!(empty.fill(Some(2018), Provenance::TitleInferred));
        assert_eq!(empty.provenance, Some(Provenance::TitleInferred));
    }

    #[test]
    fn comparison_key_ignores_case_punctuation_and_spacing() {
        assert_eq!(comparison_key("7-Speed  PDK"), "7 speed pdk");
        assert_eq!(comparison_key("Sport Chrono Package (Plus)"), "sport chrono package plus");
    }

    #[test]
    fn vin_shape_rejects_forbidden_letters() {
        assert!(is_vin_shaped("WP0AC2A90KS149200"));
        assert!(!is_vin_shaped("WP0AC2A90KS14920"));
        assert!(!is_vin_shaped("WP0AC2A90KS14920O"));
    }

    #[test]
    fn query_filters_case_insensitively_and_by_ranges() {
        let enriched = EnrichedListing {
            candidate: candidate().normalized(),
            vin: Some("WP0AC2A90KS149200".into()),
            vin_confidence: Some(VinConfidence::Medium),
            year: Field::with_value_and_provenance(2019, Provenance::VinDecoded),
            model: Field::with_value_and_provenance("911".into(), Provenance::VinDecoded),
            trim: Field::with_value_and_provenance("GT3 RS".into(), Provenance::TitleInferred),
            generation: Field::with_value_and_provenance("991.2".into(), Provenance::YearInferred),
            mileage: Field::with_value_and_provenance(4_100, Provenance::Reported),
            audit: vec![],
        };
        let listing = enriched.to_canonical(Uuid::new_v4());

        let hit = ListingQuery {
            trim: Some("gt3 rs".into()),
            sold_from: NaiveDate::from_ymd_opt(2023, 1, 1),
            price_max: Some(250_000),
            ..Default::default()
        };
        assert!(hit.matches(&listing));

        let miss = ListingQuery {
            sold_to: NaiveDate::from_ymd_opt(2022, 12, 31),
            ..Default::default()
        };
        assert!(!miss.matches(&listing));
    }

    #[test]
    fn provenance_serializes_as_kebab_tags() {
        let json = serde_json::to_string(&Provenance::YearInferred).unwrap();
        assert_eq!(json, "\"year-inferred\"");
        assert_eq!(Provenance::VinDecoded.as_str(), "vin-decoded");
    }
}
