//! VIN decoding, title inference and options canonicalization.

use std::path::Path;

use anyhow::Result;
use tracing::info;

pub mod generation;
pub mod inference;
pub mod options;
pub mod vin;

pub use generation::{generation_for, generation_from_token, GenerationSpan, GENERATIONS};
pub use inference::{
    title_tokens, ListingEnricher, MileagePolicy, MileageVerdict, RuleTarget, TitleRule,
    TitleRuleSet, TrimClass,
};
pub use options::{
    Configuration, NormalizedOptions, OptionCatalog, OptionsNormalizer, StandardEquipmentCatalog,
    StaticOptionCatalog, StaticStandardEquipment, UnmatchedOption,
};
pub use vin::{decode, DecodedVin, VinDecode, VinRejection};

pub const CRATE_NAME: &str = "vintrack-enrich";

pub const OPTION_CATALOG_FILE: &str = "option_catalog.yaml";
pub const STANDARD_EQUIPMENT_FILE: &str = "standard_equipment.yaml";
pub const TITLE_RULES_FILE: &str = "title_rules.yaml";

/// Everything read from the rules directory.
#[derive(Debug, Clone)]
pub struct RulesBundle {
    pub title_rules: TitleRuleSet,
    pub option_catalog: StaticOptionCatalog,
    pub standard_equipment: StaticStandardEquipment,
}

impl RulesBundle {
    /// `title_rules.yaml` is optional and extends the built-in rules.
    pub fn load(rules_dir: &Path) -> Result<Self> {
        let title_path = rules_dir.join(TITLE_RULES_FILE);
        let title_rules = if title_path.exists() {
            TitleRuleSet::builtin_with_file(&title_path)?
        } else {
            TitleRuleSet::builtin()
        };
        let option_catalog = StaticOptionCatalog::from_path(&rules_dir.join(OPTION_CATALOG_FILE))?;
        let standard_equipment =
            StaticStandardEquipment::from_path(&rules_dir.join(STANDARD_EQUIPMENT_FILE))?;

        info!(
            rules_dir = %rules_dir.display(),
            title_rules = title_rules.len(),
            catalog_entries = option_catalog.entries().len(),
            standard_rules = standard_equipment.rules().len(),
            "rules loaded"
        );
        Ok(Self {
            title_rules,
            option_catalog,
            standard_equipment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_rules() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../rules")
    }

    #[test]
    fn bundled_rules_directory_loads() {
        let bundle = RulesBundle::load(&workspace_rules()).expect("rules load");
        assert!(bundle.title_rules.len() > TitleRuleSet::builtin().len());
        assert!(!bundle.option_catalog.entries().is_empty());
        assert!(bundle
            .standard_equipment
            .rules()
            .iter()
            .any(|r| r.trim == "GT3" && r.generation.as_deref() == Some("991.1")));
    }

    #[test]
    fn missing_catalog_is_an_error_with_path_context() {
        let dir = std::env::temp_dir().join("vintrack-enrich-missing-rules");
        let err = RulesBundle::load(&dir).unwrap_err();
        assert!(format!("{err:#}").contains(OPTION_CATALOG_FILE));
    }
}
