//! Stratification schemes: named partitions of a cohort's samples into
//! subtypes, each subtype backed by a disease profile in the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoringError};
use crate::profile::{DiseaseContext, Profile, SignatureStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeSpec {
    pub scheme: String,
    pub cohort: String,
    /// subtype label -> sample ids
    pub subtypes: BTreeMap<String, BTreeSet<String>>,
}

impl SchemeSpec {
    pub fn new(scheme: &str, cohort: &str) -> Self {
        SchemeSpec {
            scheme: scheme.to_string(),
            cohort: cohort.to_string(),
            subtypes: BTreeMap::new(),
        }
    }

    pub fn add_sample(&mut self, subtype: &str, sample: &str) {
        self.subtypes
            .entry(subtype.to_string())
            .or_default()
            .insert(sample.to_string());
    }

    fn reject(&self, reason: impl Into<String>) -> ScoringError {
        ScoringError::MalformedStratification {
            scheme: self.scheme.clone(),
            reason: reason.into(),
        }
    }

    /// subtypes must partition the samples they mention
    fn check_exclusive(&self) -> Result<()> {
        if self.subtypes.is_empty() {
            return Err(self.reject("scheme has no subtypes"));
        }
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for (label, samples) in self.subtypes.iter() {
            if samples.is_empty() {
                return Err(self.reject(format!("subtype '{label}' has no samples")));
            }
            for s in samples.iter() {
                if let Some(prev) = owner.insert(s.as_str(), label.as_str()) {
                    return Err(self.reject(format!(
                        "sample '{s}' belongs to both '{prev}' and '{label}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Read-only after [`StratificationManager::build`].
#[derive(Debug)]
pub struct StratificationManager {
    schemes: BTreeMap<String, SchemeSpec>,
    store: Arc<SignatureStore>,
}

impl StratificationManager {
    pub fn build(schemes: Vec<SchemeSpec>, store: Arc<SignatureStore>) -> Result<Self> {
        let mut by_name: BTreeMap<String, SchemeSpec> = BTreeMap::new();
        for spec in schemes {
            if let Some(prev) = by_name.get(&spec.scheme) {
                let reason = if prev.cohort == spec.cohort {
                    "scheme given twice".to_string()
                } else {
                    format!("scheme used for cohorts '{}' and '{}'", prev.cohort, spec.cohort)
                };
                return Err(spec.reject(reason));
            }
            spec.check_exclusive()?;
            for label in spec.subtypes.keys() {
                let ctx = DiseaseContext::subtype(&spec.cohort, &spec.scheme, label);
                if !store.has_disease(&ctx) {
                    return Err(ScoringError::NotFound(format!("disease profile '{ctx}'")));
                }
            }
            tracing::debug!(
                scheme = %spec.scheme,
                cohort = %spec.cohort,
                subtypes = spec.subtypes.len(),
                "stratification loaded"
            );
            by_name.insert(spec.scheme.clone(), spec);
        }
        Ok(StratificationManager {
            schemes: by_name,
            store,
        })
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.schemes.keys().map(|k| k.as_str())
    }

    pub fn store(&self) -> &Arc<SignatureStore> {
        &self.store
    }

    /// Subtype contexts of `scheme` in label order.
    pub fn list_contexts(&self, scheme: &str) -> Result<Vec<DiseaseContext>> {
        let spec = self
            .schemes
            .get(scheme)
            .ok_or_else(|| ScoringError::NotFound(format!("stratification scheme '{scheme}'")))?;
        Ok(spec
            .subtypes
            .keys()
            .map(|label| DiseaseContext::subtype(&spec.cohort, &spec.scheme, label))
            .collect())
    }

    /// Whole-cohort contexts held by the store plus every scheme context, sorted.
    pub fn list_all_contexts(&self) -> Vec<DiseaseContext> {
        let mut all: BTreeSet<DiseaseContext> = self
            .store
            .disease_contexts()
            .into_iter()
            .filter(|c| c.subtype.is_none())
            .cloned()
            .collect();
        for spec in self.schemes.values() {
            all.extend(
                spec.subtypes
                    .keys()
                    .map(|label| DiseaseContext::subtype(&spec.cohort, &spec.scheme, label)),
            );
        }
        all.into_iter().collect()
    }

    pub fn profile_for(&self, context: &DiseaseContext) -> Result<&Profile> {
        if let Some(sub) = &context.subtype {
            let known = self
                .schemes
                .get(&sub.scheme)
                .map_or(false, |s| s.cohort == context.cohort && s.subtypes.contains_key(&sub.label));
            if !known {
                return Err(ScoringError::NotFound(format!("disease context '{context}'")));
            }
        }
        self.store.get_disease_profile(context)
    }

    pub fn samples_of(&self, context: &DiseaseContext) -> Option<&BTreeSet<String>> {
        let sub = context.subtype.as_ref()?;
        self.schemes
            .get(&sub.scheme)
            .filter(|s| s.cohort == context.cohort)?
            .subtypes
            .get(&sub.label)
    }
}
