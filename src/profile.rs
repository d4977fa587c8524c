//! Gene-level profiles and the read-only store that holds them.
//!
//! A [`Profile`] maps gene ids to one statistic each (log fold change,
//! t-statistic, connectivity z-score, ...) and optionally a significance value
//! per gene. Perturbation profiles are keyed by drug id, disease profiles by
//! [`DiseaseContext`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoringError};
use crate::utils::{DynamicEnum, Statistic};

pub type GeneId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Perturbation,
    Disease,
}

/// A subtype label is only meaningful within the scheme that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subtype {
    pub scheme: String,
    pub label: String,
}

/// (cohort, scheme, subtype) triple, or the whole cohort when `subtype` is None.
/// Whole-cohort contexts sort before any of their subtypes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiseaseContext {
    pub cohort: String,
    pub subtype: Option<Subtype>,
}

impl DiseaseContext {
    pub fn whole(cohort: &str) -> Self {
        DiseaseContext {
            cohort: cohort.to_string(),
            subtype: None,
        }
    }

    pub fn subtype(cohort: &str, scheme: &str, label: &str) -> Self {
        DiseaseContext {
            cohort: cohort.to_string(),
            subtype: Some(Subtype {
                scheme: scheme.to_string(),
                label: label.to_string(),
            }),
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        self.subtype.as_ref().map(|s| s.scheme.as_str())
    }

    /// parse `cohort` or `cohort/scheme:label`
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            None if !s.is_empty() => Some(DiseaseContext::whole(s)),
            None => None,
            Some((cohort, rest)) => {
                let (scheme, label) = rest.split_once(':')?;
                if cohort.is_empty() || scheme.is_empty() || label.is_empty() {
                    return None;
                }
                Some(DiseaseContext::subtype(cohort, scheme, label))
            }
        }
    }
}

impl fmt::Display for DiseaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtype {
            None => write!(f, "{}", self.cohort),
            Some(s) => write!(f, "{}/{}:{}", self.cohort, s.scheme, s.label),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
    id: String,
    genes: DynamicEnum<GeneId>,
    statistics: Vec<f64>,
    significance: Option<Vec<f64>>,
}

impl Profile {
    /// Validates: at least one gene, finite statistics, unique gene ids,
    /// significance (if any) of matching length within [0, 1].
    pub fn new(
        id: &str,
        genes: Vec<GeneId>,
        statistics: Vec<f64>,
        significance: Option<Vec<f64>>,
    ) -> Result<Self> {
        if genes.is_empty() {
            return Err(ScoringError::malformed(id, "profile has no genes"));
        }
        if genes.len() != statistics.len() {
            return Err(ScoringError::malformed(
                id,
                format!("{} genes but {} statistics", genes.len(), statistics.len()),
            ));
        }
        if let Some(i) = statistics.iter().position(|v| !v.is_finite()) {
            return Err(ScoringError::malformed(
                id,
                format!("non-finite statistic for gene '{}'", genes[i]),
            ));
        }
        if let Some(sig) = &significance {
            if sig.len() != genes.len() {
                return Err(ScoringError::malformed(
                    id,
                    format!("{} genes but {} significance values", genes.len(), sig.len()),
                ));
            }
            if let Some(i) = sig.iter().position(|p| !(0.0..=1.0).contains(p)) {
                return Err(ScoringError::malformed(
                    id,
                    format!("significance for gene '{}' outside [0, 1]", genes[i]),
                ));
            }
        }
        let genes = DynamicEnum::try_from_slice(&genes)
            .map_err(|g| ScoringError::malformed(id, format!("duplicate gene '{g}'")))?;
        Ok(Profile {
            id: id.to_string(),
            genes,
            statistics,
            significance,
        })
    }

    pub fn from_pairs<I, G>(id: &str, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (G, f64)>,
        G: Into<GeneId>,
    {
        let (genes, stats): (Vec<GeneId>, Vec<f64>) =
            pairs.into_iter().map(|(g, v)| (g.into(), v)).unzip();
        Profile::new(id, genes, stats, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.statistics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statistics.is_empty()
    }

    pub fn genes(&self) -> &[GeneId] {
        self.genes.get_vec()
    }

    pub fn statistics(&self) -> &[f64] {
        &self.statistics
    }

    pub fn significance(&self) -> Option<&[f64]> {
        self.significance.as_deref()
    }

    pub fn get(&self, gene: &str) -> Option<f64> {
        self.genes
            .index_of(&gene.to_string())
            .map(|&i| self.statistics[i])
    }

    pub(crate) fn index_of(&self, gene: &GeneId) -> Option<usize> {
        self.genes.index_of(gene).copied()
    }

    /// Genes ordered by descending statistic, ties in input order.
    pub fn ranked(&self) -> Vec<(&GeneId, f64)> {
        let (idx, vals) = self.statistics.as_slice().argsort(false);
        idx.into_iter()
            .zip(vals)
            .filter_map(|(i, v)| self.genes.elt_of(i).map(|g| (g, v)))
            .collect()
    }

    /// Same genes with every statistic negated.
    pub fn negated(&self, id: &str) -> Profile {
        Profile {
            id: id.to_string(),
            genes: self.genes.clone(),
            statistics: self.statistics.iter().map(|v| -v).collect(),
            significance: self.significance.clone(),
        }
    }
}

/// Immutable after construction; shared between workers behind an `Arc`.
#[derive(Debug, Default)]
pub struct SignatureStore {
    perturbations: BTreeMap<String, Profile>,
    diseases: HashMap<DiseaseContext, Profile>,
}

#[derive(Debug, Default)]
pub struct SignatureStoreBuilder {
    perturbations: BTreeMap<String, Profile>,
    diseases: HashMap<DiseaseContext, Profile>,
}

impl SignatureStoreBuilder {
    pub fn perturbation(mut self, drug: &str, profile: Profile) -> Result<Self> {
        if self.perturbations.insert(drug.to_string(), profile).is_some() {
            return Err(ScoringError::malformed(
                drug,
                "perturbation profile supplied twice",
            ));
        }
        Ok(self)
    }

    pub fn disease(mut self, context: DiseaseContext, profile: Profile) -> Result<Self> {
        let name = context.to_string();
        if self.diseases.insert(context, profile).is_some() {
            return Err(ScoringError::malformed(&name, "disease profile supplied twice"));
        }
        Ok(self)
    }

    pub fn build(self) -> SignatureStore {
        tracing::info!(
            perturbations = self.perturbations.len(),
            diseases = self.diseases.len(),
            "signature store built"
        );
        SignatureStore {
            perturbations: self.perturbations,
            diseases: self.diseases,
        }
    }
}

impl SignatureStore {
    pub fn builder() -> SignatureStoreBuilder {
        SignatureStoreBuilder::default()
    }

    pub fn get_perturbation_profile(&self, drug: &str) -> Result<&Profile> {
        self.perturbations
            .get(drug)
            .ok_or_else(|| ScoringError::NotFound(format!("perturbation profile '{drug}'")))
    }

    pub fn get_disease_profile(&self, context: &DiseaseContext) -> Result<&Profile> {
        self.diseases
            .get(context)
            .ok_or_else(|| ScoringError::NotFound(format!("disease profile '{context}'")))
    }

    pub fn has_disease(&self, context: &DiseaseContext) -> bool {
        self.diseases.contains_key(context)
    }

    /// Drug ids in ascending order.
    pub fn drugs(&self) -> impl Iterator<Item = &str> {
        self.perturbations.keys().map(|k| k.as_str())
    }

    pub fn n_drugs(&self) -> usize {
        self.perturbations.len()
    }

    pub fn disease_contexts(&self) -> Vec<&DiseaseContext> {
        let mut v: Vec<&DiseaseContext> = self.diseases.keys().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genes(v: &[&str]) -> Vec<GeneId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_profile_validation() {
        let empty = Profile::new("p", vec![], vec![], None);
        assert!(matches!(empty, Err(ScoringError::MalformedProfile { .. })));

        let nan = Profile::new("p", genes(&["a", "b"]), vec![1.0, f64::NAN], None);
        assert!(matches!(nan, Err(ScoringError::MalformedProfile { .. })));

        let dup = Profile::new("p", genes(&["a", "a"]), vec![1.0, 2.0], None);
        match dup {
            Err(ScoringError::MalformedProfile { reason, .. }) => assert!(reason.contains("'a'")),
            other => panic!("expected duplicate error, got {other:?}"),
        }

        let sig = Profile::new("p", genes(&["a"]), vec![1.0], Some(vec![1.5]));
        assert!(sig.is_err());
    }

    #[test]
    fn test_ranked_and_negated() {
        let p = Profile::from_pairs("p", [("a", 1.0), ("b", -2.0), ("c", 3.0)]).unwrap();
        let ranked: Vec<&str> = p.ranked().iter().map(|(g, _)| g.as_str()).collect();
        assert_eq!(ranked, vec!["c", "a", "b"]);
        let n = p.negated("n");
        assert_eq!(n.get("b"), Some(2.0));
        assert_eq!(n.get("zzz"), None);
    }

    #[test]
    fn test_store_lookup() {
        let p = Profile::from_pairs("d1", [("a", 1.0)]).unwrap();
        let ctx = DiseaseContext::subtype("BRCA", "pam50", "LumA");
        let store = SignatureStore::builder()
            .perturbation("d1", p.clone())
            .unwrap()
            .disease(ctx.clone(), p)
            .unwrap()
            .build();
        assert!(store.get_perturbation_profile("d1").is_ok());
        assert!(store.get_disease_profile(&ctx).is_ok());
        assert!(matches!(
            store.get_perturbation_profile("d2"),
            Err(ScoringError::NotFound(_))
        ));
        assert!(matches!(
            store.get_disease_profile(&DiseaseContext::whole("BRCA")),
            Err(ScoringError::NotFound(_))
        ));
    }

    #[test]
    fn test_context_parse_and_order() {
        let a = DiseaseContext::parse("BRCA/pam50:Basal").unwrap();
        assert_eq!(a, DiseaseContext::subtype("BRCA", "pam50", "Basal"));
        assert_eq!(a.to_string(), "BRCA/pam50:Basal");
        assert_eq!(DiseaseContext::parse("BRCA"), Some(DiseaseContext::whole("BRCA")));
        assert_eq!(DiseaseContext::parse("BRCA/pam50"), None);
        assert!(DiseaseContext::whole("BRCA") < a);
    }
}
