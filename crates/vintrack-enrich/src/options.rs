//! Options canonicalization against the option catalog and standard-equipment rules.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, warn};
use vintrack_core::{comparison_key, CatalogOption, EnrichedListing, StandardEquipmentRule};
use vintrack_storage::{call_with_retry, BackoffPolicy, TextNormalizer};

/// Read-only view of the curated option catalog.
pub trait OptionCatalog: Send + Sync {
    fn entries(&self) -> &[CatalogOption];
}

/// Read-only view of standard-equipment rules.
pub trait StandardEquipmentCatalog: Send + Sync {
    fn rules(&self) -> &[StandardEquipmentRule];
}

#[derive(Debug, Deserialize)]
struct OptionCatalogFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    options: Vec<CatalogOption>,
}

#[derive(Debug, Deserialize)]
struct StandardEquipmentFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<StandardEquipmentRule>,
}

#[derive(Debug, Clone, Default)]
pub struct StaticOptionCatalog {
    entries: Vec<CatalogOption>,
}

impl StaticOptionCatalog {
    pub fn new(mut entries: Vec<CatalogOption>) -> Self {
        entries.sort_by_key(|e| e.id);
        Self { entries }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: OptionCatalogFile = serde_yaml::from_str(text).context("parsing option catalog")?;
        Ok(Self::new(file.options))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

impl OptionCatalog for StaticOptionCatalog {
    fn entries(&self) -> &[CatalogOption] {
        &self.entries
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticStandardEquipment {
    rules: Vec<StandardEquipmentRule>,
}

impl StaticStandardEquipment {
    pub fn new(rules: Vec<StandardEquipmentRule>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: StandardEquipmentFile =
            serde_yaml::from_str(text).context("parsing standard equipment rules")?;
        Ok(Self::new(file.rules))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

impl StandardEquipmentCatalog for StaticStandardEquipment {
    fn rules(&self) -> &[StandardEquipmentRule] {
        &self.rules
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedOption {
    pub name: String,
    pub closest: Option<String>,
    pub similarity: f64,
}

/// Outcome of options canonicalization for one listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedOptions {
    /// Catalog entries, ascending by id, standard equipment removed.
    pub matched: Vec<CatalogOption>,
    pub unmatched: Vec<UnmatchedOption>,
    /// The collaborator failed; no options were extracted.
    pub degraded: bool,
}

impl NormalizedOptions {
    pub fn option_ids(&self) -> Vec<i64> {
        self.matched.iter().map(|o| o.id).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.matched.iter().map(|o| o.name.as_str()).collect()
    }
}

/// Configuration a standard-equipment rule is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Configuration<'a> {
    pub model: Option<&'a str>,
    pub trim: Option<&'a str>,
    pub generation: Option<&'a str>,
    pub year: Option<i32>,
}

impl<'a> Configuration<'a> {
    pub fn of(listing: &'a EnrichedListing) -> Self {
        Self {
            model: listing.model.value().map(String::as_str),
            trim: listing.trim.value().map(String::as_str),
            generation: listing.generation.value().map(String::as_str),
            year: listing.year.cloned_value(),
        }
    }
}

fn contains_words(haystack: &str, needle: &str) -> bool {
    !needle.is_empty() && format!(" {haystack} ").contains(&format!(" {needle} "))
}

fn compact(key: &str) -> String {
    key.chars().filter(|c| !c.is_whitespace()).collect()
}

fn rule_applies(rule: &StandardEquipmentRule, config: &Configuration<'_>) -> bool {
    let (Some(model), Some(trim)) = (config.model, config.trim) else {
        return false;
    };
    if !rule.model.eq_ignore_ascii_case(model) || !rule.trim.eq_ignore_ascii_case(trim) {
        return false;
    }
    if let Some(generation) = &rule.generation {
        if !config
            .generation
            .is_some_and(|g| g.eq_ignore_ascii_case(generation))
        {
            return false;
        }
    }
    if rule.year_from.is_some() || rule.year_to.is_some() {
        let Some(year) = config.year else {
            return false;
        };
        if rule.year_from.is_some_and(|from| year < from) || rule.year_to.is_some_and(|to| year > to) {
            return false;
        }
    }
    true
}

pub struct OptionsNormalizer {
    normalizer: Arc<dyn TextNormalizer>,
    catalog: Arc<dyn OptionCatalog>,
    standard: Arc<dyn StandardEquipmentCatalog>,
    backoff: BackoffPolicy,
    call_timeout: Duration,
}

impl OptionsNormalizer {
    pub fn new(
        normalizer: Arc<dyn TextNormalizer>,
        catalog: Arc<dyn OptionCatalog>,
        standard: Arc<dyn StandardEquipmentCatalog>,
    ) -> Self {
        Self {
            normalizer,
            catalog,
            standard,
            backoff: BackoffPolicy::default(),
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retry(mut self, backoff: BackoffPolicy, call_timeout: Duration) -> Self {
        self.backoff = backoff;
        self.call_timeout = call_timeout;
        self
    }

    /// Free text -> catalog entries. A collaborator failure after retries yields a
    /// degraded, empty result instead of an error.
    pub async fn normalize(&self, options_text: &str) -> NormalizedOptions {
        if options_text.trim().is_empty() {
            return NormalizedOptions::default();
        }

        let names = call_with_retry(
            &self.backoff,
            self.call_timeout,
            "normalize_options_text",
            || self.normalizer.normalize_options_text(options_text),
        )
        .await;

        match names {
            Ok(names) => {
                let (matched, unmatched) = self.match_names(&names);
                NormalizedOptions {
                    matched,
                    unmatched,
                    degraded: false,
                }
            }
            Err(err) => {
                warn!(error = %err, "options normalizer gave up; no options extracted");
                NormalizedOptions {
                    degraded: true,
                    ..Default::default()
                }
            }
        }
    }

    /// `normalize` followed by `filter_standard` for the listing's configuration.
    pub async fn canonicalize(&self, listing: &EnrichedListing) -> NormalizedOptions {
        let Some(text) = listing.candidate.options_text.as_deref() else {
            return NormalizedOptions::default();
        };
        let mut result = self.normalize(text).await;
        result.matched = self.filter_standard(result.matched, &Configuration::of(listing));
        result
    }

    pub fn match_names(&self, names: &[String]) -> (Vec<CatalogOption>, Vec<UnmatchedOption>) {
        let entries: Vec<(String, &CatalogOption)> = self
            .catalog
            .entries()
            .iter()
            .map(|e| (comparison_key(&e.name), e))
            .collect();

        let mut matched: Vec<CatalogOption> = Vec::new();
        let mut unmatched: Vec<UnmatchedOption> = Vec::new();

        for name in names {
            let key = comparison_key(name);
            if key.is_empty() {
                continue;
            }
            match best_match(&key, &entries) {
                Some(option) => {
                    if !matched.iter().any(|m| m.id == option.id) {
                        matched.push(option.clone());
                    }
                }
                None => {
                    let closest = entries
                        .iter()
                        .map(|(entry_key, e)| (jaro_winkler(&key, entry_key), *e))
                        .max_by(|a, b| a.0.total_cmp(&b.0));
                    warn!(
                        option = %name,
                        closest = closest.map(|(_, e)| e.name.as_str()).unwrap_or("-"),
                        "option not in catalog"
                    );
                    if !unmatched.iter().any(|u| comparison_key(&u.name) == key) {
                        unmatched.push(UnmatchedOption {
                            name: name.trim().to_string(),
                            closest: closest.map(|(_, e)| e.name.clone()),
                            similarity: closest.map(|(s, _)| s).unwrap_or(0.0),
                        });
                    }
                }
            }
        }

        matched.sort_by_key(|o| o.id);
        (matched, unmatched)
    }

    /// Drops options that are standard on the given configuration.
    pub fn filter_standard(
        &self,
        options: Vec<CatalogOption>,
        config: &Configuration<'_>,
    ) -> Vec<CatalogOption> {
        let features: Vec<String> = self
            .standard
            .rules()
            .iter()
            .filter(|rule| rule_applies(rule, config))
            .flat_map(|rule| rule.features.iter().map(|f| comparison_key(f)))
            .collect();
        if features.is_empty() {
            return options;
        }

        options
            .into_iter()
            .filter(|option| {
                let key = comparison_key(&option.name);
                let standard = features
                    .iter()
                    .any(|f| *f == key || contains_words(&key, f) || contains_words(f, &key));
                if standard {
                    debug!(option = %option.name, "standard equipment removed");
                }
                !standard
            })
            .collect()
    }
}

/// Exact (or spacing-insensitive) key match first, then whole-word containment
/// either way with the closest length; ties go to the lowest catalog id.
fn best_match<'a>(key: &str, entries: &[(String, &'a CatalogOption)]) -> Option<&'a CatalogOption> {
    let compact_key = compact(key);
    let exact = entries
        .iter()
        .filter(|(entry_key, _)| *entry_key == key || compact(entry_key) == compact_key)
        .map(|(_, e)| *e)
        .min_by_key(|e| e.id);
    if exact.is_some() {
        return exact;
    }

    entries
        .iter()
        .filter(|(entry_key, _)| contains_words(entry_key, key) || contains_words(key, entry_key))
        .min_by_key(|(entry_key, e)| (entry_key.len().abs_diff(key.len()), e.id))
        .map(|(_, e)| *e)
}
