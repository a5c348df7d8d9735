//! Title rules, mileage plausibility and the field inferencer.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vintrack_core::{
    comparison_key, is_vin_shaped, EnrichedListing, Field, ListingCandidate, Provenance,
    VinConfidence,
};

use crate::generation::{generation_for, generation_from_token};
use crate::vin::VinDecode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    Model,
    Trim,
}

/// One text pattern -> field value. Trim rules are scoped to a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleRule {
    pub target: RuleTarget,
    pub pattern: String,
    pub value: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl TitleRule {
    fn new(target: RuleTarget, pattern: &str, value: &str, model: Option<&str>) -> Self {
        Self {
            target,
            pattern: pattern.to_string(),
            value: value.to_string(),
            model: model.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: TitleRule,
    tokens: Vec<String>,
}

impl CompiledRule {
    fn specificity(&self) -> (usize, usize) {
        (self.tokens.len(), self.rule.pattern.len())
    }

    fn matches(&self, title_tokens: &[String]) -> bool {
        !self.tokens.is_empty()
            && title_tokens
                .windows(self.tokens.len())
                .any(|window| window == self.tokens.as_slice())
    }
}

#[derive(Debug, Deserialize)]
struct TitleRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TitleRule>,
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"[a-z0-9]+(?:[./][a-z0-9]+)*").expect("static token regex"))
}

fn year_regex() -> &'static Regex {
    static YEAR: OnceLock<Regex> = OnceLock::new();
    YEAR.get_or_init(|| Regex::new(r"\b(19[5-9][0-9]|20[0-9]{2})\b").expect("static year regex"))
}

/// Earliest model year accepted from a listing's reported year or title.
const EARLIEST_MODEL_YEAR: i32 = 1948;

fn plausible_year(year: i32, reference_year: i32) -> bool {
    (EARLIEST_MODEL_YEAR..=reference_year.saturating_add(1)).contains(&year)
}

/// First plausible model year in the title. Distances such as "2000-Mile" are skipped.
fn title_year(title: &str, reference_year: i32) -> Option<i32> {
    year_regex().captures_iter(title).find_map(|c| {
        let m = c.get(1)?;
        let unit = title[m.end()..]
            .trim_start_matches(|ch: char| ch == '-' || ch.is_whitespace())
            .to_lowercase();
        if ["mile", "km", "kilomet"].iter().any(|u| unit.starts_with(u)) {
            return None;
        }
        m.as_str()
            .parse::<i32>()
            .ok()
            .filter(|y| plausible_year(*y, reference_year))
    })
}

/// Lower-cased title tokens; "991.2", "4.0" and "s/t" stay whole.
pub fn title_tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    token_regex()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Ordered rule list evaluated most-specific-first (more tokens, then longer pattern).
#[derive(Debug, Clone)]
pub struct TitleRuleSet {
    rules: Vec<CompiledRule>,
}

impl TitleRuleSet {
    pub fn new(rules: Vec<TitleRule>) -> Self {
        let mut rules: Vec<CompiledRule> = rules
            .into_iter()
            .map(|rule| CompiledRule {
                tokens: title_tokens(&rule.pattern),
                rule,
            })
            .collect();
        rules.sort_by(|a, b| b.specificity().cmp(&a.specificity()));
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: TitleRulesFile = serde_yaml::from_str(text).context("parsing title rules")?;
        Ok(Self::new(file.rules))
    }

    /// Built-in rules followed by the rules in `path`.
    pub fn builtin_with_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: TitleRulesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let mut rules = builtin_rules();
        rules.extend(file.rules);
        Ok(Self::new(rules))
    }

    pub fn builtin() -> Self {
        Self::new(builtin_rules())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn match_model(&self, tokens: &[String]) -> Option<&str> {
        self.rules
            .iter()
            .filter(|r| r.rule.target == RuleTarget::Model)
            .find(|r| r.matches(tokens))
            .map(|r| r.rule.value.as_str())
    }

    /// Returns (trim, implied model). With a known model only its rules are tried;
    /// otherwise the best-specificity matches must agree before anything is filled.
    pub fn match_trim(&self, model: Option<&str>, tokens: &[String]) -> (Option<String>, Option<String>) {
        let trim_rules = self
            .rules
            .iter()
            .filter(|r| r.rule.target == RuleTarget::Trim);

        if let Some(model) = model {
            let hit = trim_rules
                .filter(|r| {
                    r.rule
                        .model
                        .as_deref()
                        .map_or(true, |m| m.eq_ignore_ascii_case(model))
                })
                .find(|r| r.matches(tokens));
            return (hit.map(|r| r.rule.value.clone()), None);
        }

        let hits: Vec<&CompiledRule> = trim_rules.filter(|r| r.matches(tokens)).collect();
        let Some(best) = hits.first() else {
            return (None, None);
        };
        let top: Vec<&&CompiledRule> = hits
            .iter()
            .filter(|r| r.specificity() == best.specificity())
            .collect();

        let same_trim = top.iter().all(|r| r.rule.value == best.rule.value);
        let same_model = top.iter().all(|r| r.rule.model == best.rule.model);
        match (same_trim, same_model) {
            (true, true) => (Some(best.rule.value.clone()), best.rule.model.clone()),
            (true, false) => (Some(best.rule.value.clone()), None),
            _ => (None, None),
        }
    }
}

fn builtin_rules() -> Vec<TitleRule> {
    use RuleTarget::{Model, Trim};

    let mut rules = vec![
        TitleRule::new(Model, "carrera gt", "Carrera GT", None),
        TitleRule::new(Model, "911", "911", None),
        TitleRule::new(Model, "718 cayman", "Cayman", None),
        TitleRule::new(Model, "cayman", "Cayman", None),
        TitleRule::new(Model, "718 boxster", "Boxster", None),
        TitleRule::new(Model, "boxster", "Boxster", None),
        TitleRule::new(Model, "cayenne", "Cayenne", None),
        TitleRule::new(Model, "macan", "Macan", None),
        TitleRule::new(Model, "panamera", "Panamera", None),
        TitleRule::new(Model, "taycan", "Taycan", None),
    ];

    let trims: &[(&str, &[(&str, &str)])] = &[
        (
            "911",
            &[
                ("gt3 rs", "GT3 RS"),
                ("gt3rs", "GT3 RS"),
                ("gt3 touring", "GT3 Touring"),
                ("gt3", "GT3"),
                ("gt2 rs", "GT2 RS"),
                ("gt2", "GT2"),
                ("turbo s", "Turbo S"),
                ("turbo", "Turbo"),
                ("carrera 4 gts", "Carrera 4 GTS"),
                ("carrera gts", "Carrera GTS"),
                ("carrera 4s", "Carrera 4S"),
                ("carrera s", "Carrera S"),
                ("carrera 4", "Carrera 4"),
                ("carrera t", "Carrera T"),
                ("carrera", "Carrera"),
                ("targa 4 gts", "Targa 4 GTS"),
                ("targa 4s", "Targa 4S"),
                ("targa 4", "Targa 4"),
                ("sport classic", "Sport Classic"),
                ("dakar", "Dakar"),
                ("s/t", "S/T"),
                ("911 r", "R"),
            ],
        ),
        (
            "Cayman",
            &[
                ("gt4 rs", "GT4 RS"),
                ("gt4", "GT4"),
                ("gts 4.0", "GTS 4.0"),
                ("gts", "GTS"),
                ("cayman s", "S"),
                ("cayman r", "R"),
            ],
        ),
        (
            "Boxster",
            &[
                ("spyder rs", "Spyder RS"),
                ("spyder", "Spyder"),
                ("gts 4.0", "GTS 4.0"),
                ("gts", "GTS"),
                ("boxster s", "S"),
                ("25 years", "25 Years"),
            ],
        ),
        (
            "Cayenne",
            &[
                ("turbo s e-hybrid", "Turbo S E-Hybrid"),
                ("turbo gt", "Turbo GT"),
                ("turbo s", "Turbo S"),
                ("turbo", "Turbo"),
                ("gts", "GTS"),
                ("e-hybrid", "E-Hybrid"),
                ("cayenne s", "S"),
            ],
        ),
        (
            "Macan",
            &[
                ("gts", "GTS"),
                ("turbo", "Turbo"),
                ("macan s", "S"),
                ("macan t", "T"),
            ],
        ),
        (
            "Panamera",
            &[
                ("turbo s", "Turbo S"),
                ("turbo", "Turbo"),
                ("gts", "GTS"),
                ("4 e-hybrid", "4 E-Hybrid"),
                ("4s", "4S"),
            ],
        ),
        (
            "Taycan",
            &[
                ("turbo s", "Turbo S"),
                ("turbo", "Turbo"),
                ("gts", "GTS"),
                ("4 cross turismo", "4 Cross Turismo"),
                ("4s", "4S"),
            ],
        ),
    ];

    for (model, entries) in trims {
        for (pattern, value) in entries.iter() {
            rules.push(TitleRule::new(Trim, pattern, value, Some(model)));
        }
    }
    rules
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimClass {
    Standard,
    Track,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MileageVerdict {
    Accepted(i64),
    Corrected { reported: i64, corrected: i64, divisor: i64 },
    Discarded { reported: i64, ceiling: i64 },
}

#[derive(Debug, Clone)]
pub struct MileagePolicy {
    pub standard_per_year: i64,
    pub track_per_year: i64,
    pub near_new_per_year: i64,
    pub floor: i64,
    pub unknown_age_years: i32,
    pub track_trims: Vec<String>,
}

impl Default for MileagePolicy {
    fn default() -> Self {
        Self {
            standard_per_year: 12_000,
            track_per_year: 5_000,
            near_new_per_year: 20_000,
            floor: 8_000,
            unknown_age_years: 25,
            track_trims: [
                "GT3", "GT3 RS", "GT3 Touring", "GT2 RS", "GT4", "GT4 RS", "Spyder RS", "Cup",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
        }
    }
}

impl MileagePolicy {
    pub fn trim_class(&self, trim: Option<&str>) -> TrimClass {
        let Some(trim) = trim else {
            return TrimClass::Standard;
        };
        let key = comparison_key(trim);
        if self.track_trims.iter().any(|t| comparison_key(t) == key) {
            TrimClass::Track
        } else {
            TrimClass::Standard
        }
    }

    /// `max(age * per_year_cap, floor)`; cars within one model-year of new get the
    /// relaxed cap for at least one full year.
    pub fn max_reasonable_mileage(&self, age_years: Option<i32>, class: TrimClass) -> i64 {
        let age = i64::from(age_years.unwrap_or(self.unknown_age_years).max(0));
        let class_cap = match class {
            TrimClass::Standard => self.standard_per_year,
            TrimClass::Track => self.track_per_year,
        };
        let allowance = if age <= 1 {
            age.max(1) * self.near_new_per_year.max(class_cap)
        } else {
            age * class_cap
        };
        allowance.max(self.floor)
    }

    pub fn check(&self, mileage: i64, age_years: Option<i32>, class: TrimClass) -> MileageVerdict {
        let ceiling = self.max_reasonable_mileage(age_years, class);
        if mileage < 0 {
            return MileageVerdict::Discarded {
                reported: mileage,
                ceiling,
            };
        }
        if mileage <= ceiling {
            return MileageVerdict::Accepted(mileage);
        }
        for divisor in [10, 100] {
            let corrected = mileage / divisor;
            if corrected <= ceiling {
                return MileageVerdict::Corrected {
                    reported: mileage,
                    corrected,
                    divisor,
                };
            }
        }
        MileageVerdict::Discarded {
            reported: mileage,
            ceiling,
        }
    }
}

/// Fills year/model/trim/generation and validates mileage for one candidate.
#[derive(Debug, Clone)]
pub struct ListingEnricher {
    rules: TitleRuleSet,
    mileage: MileagePolicy,
}

impl Default for ListingEnricher {
    fn default() -> Self {
        Self::new(TitleRuleSet::builtin(), MileagePolicy::default())
    }
}

impl ListingEnricher {
    pub fn new(rules: TitleRuleSet, mileage: MileagePolicy) -> Self {
        Self { rules, mileage }
    }

    pub fn mileage_policy(&self) -> &MileagePolicy {
        &self.mileage
    }

    pub fn enrich(&self, candidate: ListingCandidate, decode: Option<&VinDecode>) -> EnrichedListing {
        let candidate = candidate.normalized();
        let mut out = EnrichedListing {
            vin: candidate.vin.clone().filter(|v| is_vin_shaped(v)),
            vin_confidence: decode.map(VinDecode::confidence),
            year: Field::empty(),
            model: Field::empty(),
            trim: Field::empty(),
            generation: Field::empty(),
            mileage: Field::empty(),
            audit: Vec::new(),
            candidate,
        };

        if let Some(VinDecode::Invalid { reason }) = decode {
            out.audit.push(format!("vin-confidence=invalid: {reason}"));
        }

        let high = decode
            .filter(|d| d.confidence() == VinConfidence::High)
            .and_then(VinDecode::fields)
            .filter(|f| {
                f.model_year.is_some()
                    && f.model.is_some()
                    && f.trim.is_some()
                    && f.generation.is_some()
            });

        if let Some(fields) = high {
            out.year.fill(fields.model_year, Provenance::VinDecoded);
            out.model.fill(fields.model.clone(), Provenance::VinDecoded);
            out.trim.fill(fields.trim.clone(), Provenance::VinDecoded);
            out.generation
                .fill(fields.generation.clone(), Provenance::VinDecoded);
            out.audit
                .push("fields accepted from high-confidence vin".to_string());
        } else {
            self.infer_from_text(&mut out, decode);
        }

        self.check_mileage(&mut out);
        debug!(
            source_url = %out.candidate.source_url,
            tags = ?out.provenance_tags(),
            "listing enriched"
        );
        out
    }

    fn infer_from_text(&self, out: &mut EnrichedListing, decode: Option<&VinDecode>) {
        if let Some(fields) = decode.and_then(VinDecode::fields) {
            out.year.fill(fields.model_year, Provenance::VinDecoded);
            out.model.fill(fields.model.clone(), Provenance::VinDecoded);
            out.trim.fill(fields.trim.clone(), Provenance::VinDecoded);
        }
        let reference_year = out.candidate.reference_year();
        match out.candidate.year {
            Some(year) if !plausible_year(year, reference_year) => {
                out.audit.push(format!(
                    "reported year {year} ignored, outside {EARLIEST_MODEL_YEAR}..={}",
                    reference_year.saturating_add(1)
                ));
            }
            reported => {
                out.year.fill(reported, Provenance::Reported);
            }
        }

        let tokens = title_tokens(&out.candidate.title);
        out.year.fill(
            title_year(&out.candidate.title, reference_year),
            Provenance::TitleInferred,
        );

        out.model.fill(
            self.rules.match_model(&tokens).map(str::to_string),
            Provenance::TitleInferred,
        );

        if out.trim.is_empty() {
            let (trim, implied_model) = self.rules.match_trim(out.model.value().map(String::as_str), &tokens);
            if out.model.fill(implied_model, Provenance::TitleInferred) {
                out.audit.push("model implied by trim rule".to_string());
            }
            out.trim.fill(trim, Provenance::TitleInferred);
        }

        if out.generation.is_empty() {
            self.infer_generation(out, &tokens);
        }
    }

    fn infer_generation(&self, out: &mut EnrichedListing, tokens: &[String]) {
        let Some(model) = out.model.cloned_value() else {
            return;
        };
        let year = out.year.cloned_value();

        let from_title = tokens
            .iter()
            .find_map(|t| generation_from_token(&model, t, year));
        if out.generation.fill(from_title, Provenance::TitleInferred) {
            return;
        }

        if let Some(year) = year {
            out.generation.fill(
                generation_for(&model, year).map(str::to_string),
                Provenance::YearInferred,
            );
        }
    }

    fn check_mileage(&self, out: &mut EnrichedListing) {
        let Some(reported) = out.candidate.mileage else {
            return;
        };
        let age = out
            .year
            .cloned_value()
            .and_then(|y| out.candidate.reference_year().checked_sub(y));
        let class = self.mileage.trim_class(out.trim.value().map(String::as_str));

        match self.mileage.check(reported, age, class) {
            MileageVerdict::Accepted(m) => {
                out.mileage.replace(m, Provenance::Reported);
            }
            MileageVerdict::Corrected {
                reported,
                corrected,
                divisor,
            } => {
                out.mileage.replace(corrected, Provenance::MileageCorrected);
                out.audit.push(format!(
                    "mileage {reported} corrected to {corrected} (divided by {divisor})"
                ));
            }
            MileageVerdict::Discarded { reported, ceiling } => {
                out.mileage.clear();
                out.audit.push(format!(
                    "mileage {reported} discarded, ceiling {ceiling}"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vin::decode;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn candidate(title: &str) -> ListingCandidate {
        ListingCandidate {
            source_id: "bat".into(),
            source_url: "https://example.com/l/1".into(),
            title: title.into(),
            vin: None,
            year: None,
            price: Some(200_000),
            mileage: None,
            exterior_color: None,
            interior_color: None,
            location: None,
            options_text: None,
            sold_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            scraped_at: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn rs_variant_is_not_classified_as_base_trim() {
        let out = ListingEnricher::default().enrich(candidate("2019 911 GT3 RS"), None);
        assert_eq!(out.trim.value().map(String::as_str), Some("GT3 RS"));
        assert_eq!(out.model.value().map(String::as_str), Some("911"));
        assert_eq!(out.year.value(), Some(&2019));
        assert_eq!(out.generation.value().map(String::as_str), Some("991.2"));
        assert_eq!(out.generation.provenance, Some(Provenance::YearInferred));
        assert_eq!(out.trim.provenance, Some(Provenance::TitleInferred));
    }

    #[test]
    fn specificity_does_not_depend_on_rule_order() {
        let rules = TitleRuleSet::new(vec![
            TitleRule::new(RuleTarget::Trim, "gt3", "GT3", Some("911")),
            TitleRule::new(RuleTarget::Trim, "gt3 rs", "GT3 RS", Some("911")),
        ]);
        let (trim, _) = rules.match_trim(Some("911"), &title_tokens("Porsche 911 GT3 RS Weissach"));
        assert_eq!(trim.as_deref(), Some("GT3 RS"));
    }

    #[test]
    fn high_confidence_vin_is_accepted_over_title() {
        let mut c = candidate("2018 Porsche 911 Turbo");
        c.vin = Some("WP0AB2A90KS123456".into());
        let decoded = decode("WP0AB2A90KS123456");
        let out = ListingEnricher::default().enrich(c, Some(&decoded));
        assert_eq!(out.trim.value().map(String::as_str), Some("Carrera S"));
        assert_eq!(out.year.value(), Some(&2019));
        assert_eq!(out.generation.provenance, Some(Provenance::VinDecoded));
        assert_eq!(out.vin_confidence, Some(VinConfidence::High));
    }

    #[test]
    fn medium_vin_seeds_fields_and_title_fills_trim() {
        let mut c = candidate("Porsche GT3 RS Weissach Package");
        c.vin = Some("WP0AC2A90KS149200".into());
        let decoded = decode("WP0AC2A90KS149200");
        let out = ListingEnricher::default().enrich(c, Some(&decoded));
        assert_eq!(out.year.provenance, Some(Provenance::VinDecoded));
        assert_eq!(out.model.provenance, Some(Provenance::VinDecoded));
        assert_eq!(out.trim.value().map(String::as_str), Some("GT3 RS"));
        assert_eq!(out.trim.provenance, Some(Provenance::TitleInferred));
        assert_eq!(out.generation.value().map(String::as_str), Some("991.2"));
    }

    #[test]
    fn title_generation_token_beats_year_table() {
        let out = ListingEnricher::default().enrich(candidate("2016 911 GT3 (991.2 spec)"), None);
        assert_eq!(out.generation.value().map(String::as_str), Some("991.2"));
        assert_eq!(out.generation.provenance, Some(Provenance::TitleInferred));

        let out = ListingEnricher::default().enrich(candidate("2018 Porsche 991 Carrera T"), None);
        assert_eq!(out.generation.value().map(String::as_str), Some("991.2"));
        assert_eq!(out.trim.value().map(String::as_str), Some("Carrera T"));
    }

    #[test]
    fn trim_is_never_fabricated() {
        let out = ListingEnricher::default().enrich(candidate("2018 Porsche 911 Coupe"), None);
        assert!(out.trim.is_empty());
        assert_eq!(out.model.value().map(String::as_str), Some("911"));
    }

    #[test]
    fn trim_rule_implies_model_only_when_unambiguous() {
        let out = ListingEnricher::default().enrich(candidate("2017 Porsche GT4 Clubsport"), None);
        assert_eq!(out.model.value().map(String::as_str), Some("Cayman"));
        assert_eq!(out.trim.value().map(String::as_str), Some("GT4"));

        let out = ListingEnricher::default().enrich(candidate("2021 Porsche Turbo S"), None);
        assert!(out.model.is_empty());
        assert_eq!(out.trim.value().map(String::as_str), Some("Turbo S"));
    }

    #[test]
    fn invalid_vin_falls_back_to_title_and_is_flagged() {
        let mut c = candidate("2019 911 GT3 RS");
        c.vin = Some("NOT-A-VIN".into());
        let decoded = decode("NOTAVIN");
        let out = ListingEnricher::default().enrich(c, Some(&decoded));
        assert_eq!(out.vin_confidence, Some(VinConfidence::Invalid));
        assert_eq!(out.vin, None);
        assert_eq!(out.trim.value().map(String::as_str), Some("GT3 RS"));
        assert!(out.audit.iter().any(|a| a.starts_with("vin-confidence=invalid")));
    }

    #[test]
    fn implausible_mileage_is_shifted_or_dropped() {
        let enricher = ListingEnricher::default();

        let mut c = candidate("2019 911 GT3 RS");
        c.mileage = Some(120_000);
        let out = enricher.enrich(c, None);
        assert_eq!(out.mileage.value(), Some(&12_000));
        assert_eq!(out.mileage.provenance, Some(Provenance::MileageCorrected));

        let mut c = candidate("2019 911 GT3 RS");
        c.mileage = Some(9_999_999);
        let out = enricher.enrich(c, None);
        assert!(out.mileage.is_empty());

        let mut c = candidate("2019 911 Carrera");
        c.mileage = Some(48_000);
        let out = enricher.enrich(c, None);
        assert_eq!(out.mileage.value(), Some(&48_000));
        assert_eq!(out.mileage.provenance, Some(Provenance::Reported));
    }

    #[test]
    fn out_of_range_reported_year_is_ignored() {
        let enricher = ListingEnricher::default();

        let mut c = candidate("Porsche 911 Carrera");
        c.year = Some(i32::MIN);
        c.mileage = Some(10_000);
        let out = enricher.enrich(c, None);
        assert!(out.year.is_empty());
        assert!(out.audit.iter().any(|a| a.starts_with("reported year")));
        assert_eq!(out.mileage.value(), Some(&10_000));
        assert_eq!(out.mileage.provenance, Some(Provenance::Reported));

        let mut c = candidate("2019 Porsche 911 GT3 RS");
        c.year = Some(3000);
        c.mileage = Some(4_000);
        let out = enricher.enrich(c, None);
        assert_eq!(out.year.value(), Some(&2019));
        assert_eq!(out.year.provenance, Some(Provenance::TitleInferred));

        let mut c = candidate("Porsche 911 Carrera");
        c.year = Some(i32::MAX);
        c.mileage = Some(10_000);
        let out = enricher.enrich(c, None);
        assert!(out.year.is_empty());
        assert_eq!(out.mileage.value(), Some(&10_000));
    }

    #[test]
    fn mileage_in_the_title_is_not_a_model_year() {
        let enricher = ListingEnricher::default();

        let out = enricher.enrich(candidate("2000-Mile 2019 Porsche 911 GT3"), None);
        assert_eq!(out.year.value(), Some(&2019));
        assert_eq!(out.generation.value().map(String::as_str), Some("991.2"));

        let out = enricher.enrich(candidate("1995 Miles: 2016 Porsche 911 GT3"), None);
        assert_eq!(out.year.value(), Some(&2016));

        let out = enricher.enrich(candidate("2026 Porsche 911 GT3 Touring"), None);
        assert!(out.year.is_empty());
    }

    #[test]
    fn ceiling_scales_with_age_class_and_newness() {
        let policy = MileagePolicy::default();
        assert_eq!(policy.max_reasonable_mileage(Some(5), TrimClass::Track), 25_000);
        assert_eq!(policy.max_reasonable_mileage(Some(5), TrimClass::Standard), 60_000);
        assert_eq!(policy.max_reasonable_mileage(Some(0), TrimClass::Track), 20_000);
        assert_eq!(policy.max_reasonable_mileage(Some(1), TrimClass::Standard), 20_000);
        assert_eq!(policy.max_reasonable_mileage(Some(-1), TrimClass::Standard), 20_000);
        assert_eq!(policy.max_reasonable_mileage(None, TrimClass::Standard), 300_000);
        assert_eq!(policy.trim_class(Some("gt3 rs")), TrimClass::Track);
        assert_eq!(policy.trim_class(Some("Carrera S")), TrimClass::Standard);
    }

    #[test]
    fn yaml_rules_extend_the_rule_set() {
        let rules = TitleRuleSet::from_yaml_str(
            "version: 1\nrules:\n  - target: trim\n    pattern: clubsport\n    value: Clubsport\n    model: Cayman\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        let (trim, _) = rules.match_trim(Some("Cayman"), &title_tokens("GT4 Clubsport"));
        assert_eq!(trim.as_deref(), Some("Clubsport"));
    }
}
