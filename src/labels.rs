use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoringError};
use crate::profile::DiseaseContext;

/// Ground truth of a drug for one disease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Indicated,
    Contraindicated,
    Unknown,
}

impl Label {
    pub fn is_known(&self) -> bool {
        !matches!(self, Label::Unknown)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Label::Indicated => "indicated",
            Label::Contraindicated => "contraindicated",
            Label::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for Label {
    type Err = ScoringError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indicated" | "indication" | "1" => Ok(Label::Indicated),
            "contraindicated" | "contraindication" | "-1" => Ok(Label::Contraindicated),
            "unknown" | "na" | "0" | "" => Ok(Label::Unknown),
            _ => Err(ScoringError::Config(format!("unknown drug label '{s}'"))),
        }
    }
}

/// Drug labels per disease (cohort). A subtype context sees the labels of its
/// cohort unless the context carries its own override for a drug.
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    cohorts: HashMap<String, BTreeMap<String, Label>>,
    overrides: HashMap<DiseaseContext, BTreeMap<String, Label>>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cohort: &str, drug: &str, label: Label) -> Option<Label> {
        self.cohorts
            .entry(cohort.to_string())
            .or_default()
            .insert(drug.to_string(), label)
    }

    pub fn insert_override(
        &mut self,
        context: DiseaseContext,
        drug: &str,
        label: Label,
    ) -> Option<Label> {
        self.overrides
            .entry(context)
            .or_default()
            .insert(drug.to_string(), label)
    }

    pub fn label(&self, context: &DiseaseContext, drug: &str) -> Label {
        self.overrides
            .get(context)
            .and_then(|m| m.get(drug))
            .or_else(|| self.cohorts.get(&context.cohort).and_then(|m| m.get(drug)))
            .copied()
            .unwrap_or(Label::Unknown)
    }

    /// Effective labels of `context`, drug ids ascending.
    pub fn labels_for(&self, context: &DiseaseContext) -> BTreeMap<String, Label> {
        let mut merged = self.cohorts.get(&context.cohort).cloned().unwrap_or_default();
        if let Some(o) = self.overrides.get(context) {
            merged.extend(o.iter().map(|(d, l)| (d.clone(), *l)));
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty() && self.overrides.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        assert_eq!("Indicated".parse::<Label>().unwrap(), Label::Indicated);
        assert_eq!("-1".parse::<Label>().unwrap(), Label::Contraindicated);
        assert_eq!("NA".parse::<Label>().unwrap(), Label::Unknown);
        assert!("maybe".parse::<Label>().is_err());
    }

    #[test]
    fn test_override_shadows_cohort_label() {
        let mut ls = LabelSet::new();
        ls.insert("BRCA", "tamoxifen", Label::Indicated);
        ls.insert("BRCA", "estradiol", Label::Contraindicated);
        let basal = DiseaseContext::subtype("BRCA", "pam50", "Basal");
        ls.insert_override(basal.clone(), "tamoxifen", Label::Unknown);

        assert_eq!(ls.label(&DiseaseContext::whole("BRCA"), "tamoxifen"), Label::Indicated);
        assert_eq!(ls.label(&basal, "tamoxifen"), Label::Unknown);
        assert_eq!(ls.label(&basal, "estradiol"), Label::Contraindicated);
        assert_eq!(ls.label(&DiseaseContext::whole("LUAD"), "tamoxifen"), Label::Unknown);

        let merged = ls.labels_for(&basal);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["tamoxifen"], Label::Unknown);
    }
}
