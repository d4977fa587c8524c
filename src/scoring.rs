//! The registry of scoring functions comparing a perturbation profile with a
//! disease profile.
//!
//! Every function carries fixed metadata: its family, its polarity and whether
//! it needs a gene set enrichment backend. Scores are deterministic for
//! identical inputs and seeds.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::backend::{CallGuard, CancelToken, EnrichmentRequest, GeneSet, GseBackend, RankedList};
use crate::error::{Result, ScoringError};
use crate::gsva::{combine_pathway_scores, GeneSetCollection, Gsva, PathwayScore};
use crate::profile::{GeneId, Profile};
use crate::stats::fisher_combine;
use crate::utils::Statistic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringFunction {
    XSum,
    XCos,
    Pearson,
    Spearman,
    GseaConnectivity,
    GseaReversal,
    /// pathway-level comparison over a gene set collection
    Gsva,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Overlap,
    Correlation,
    GeneSetEnrichment,
    Pathway,
}

/// Which end of a function's score range marks a repositioning candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// more negative = more anti-correlated = stronger candidate
    LowerIsStronger,
    HigherIsStronger,
}

impl Polarity {
    /// Larger key = stronger candidate. Both zeros map to `+0.0`, so equal
    /// scores always compare equal.
    pub fn strength(&self, score: f64) -> f64 {
        let key = match self {
            Polarity::LowerIsStronger => -score,
            Polarity::HigherIsStronger => score,
        };
        if key == 0.0 {
            0.0
        } else {
            key
        }
    }
}

impl ScoringFunction {
    pub const ALL: [ScoringFunction; 7] = [
        ScoringFunction::XSum,
        ScoringFunction::XCos,
        ScoringFunction::Pearson,
        ScoringFunction::Spearman,
        ScoringFunction::GseaConnectivity,
        ScoringFunction::GseaReversal,
        ScoringFunction::Gsva,
    ];

    /// Registered unless a run selects otherwise. `Gsva` needs a gene set
    /// collection and is opt-in.
    pub const DEFAULT: [ScoringFunction; 6] = [
        ScoringFunction::XSum,
        ScoringFunction::XCos,
        ScoringFunction::Pearson,
        ScoringFunction::Spearman,
        ScoringFunction::GseaConnectivity,
        ScoringFunction::GseaReversal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScoringFunction::XSum => "xsum",
            ScoringFunction::XCos => "xcos",
            ScoringFunction::Pearson => "pearson",
            ScoringFunction::Spearman => "spearman",
            ScoringFunction::GseaConnectivity => "gsea_connectivity",
            ScoringFunction::GseaReversal => "gsea_reversal",
            ScoringFunction::Gsva => "gsva",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            ScoringFunction::XSum | ScoringFunction::XCos => Family::Overlap,
            ScoringFunction::Pearson | ScoringFunction::Spearman => Family::Correlation,
            ScoringFunction::GseaConnectivity | ScoringFunction::GseaReversal => {
                Family::GeneSetEnrichment
            }
            ScoringFunction::Gsva => Family::Pathway,
        }
    }

    pub fn polarity(&self) -> Polarity {
        match self {
            ScoringFunction::GseaReversal => Polarity::HigherIsStronger,
            _ => Polarity::LowerIsStronger,
        }
    }

    pub fn requires_backend(&self) -> bool {
        self.family() == Family::GeneSetEnrichment
    }
}

impl fmt::Display for ScoringFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScoringFunction {
    type Err = ScoringError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        ScoringFunction::ALL
            .into_iter()
            .find(|f| f.name() == key)
            .ok_or_else(|| ScoringError::Config(format!("unknown scoring function '{s}'")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringParams {
    /// top/bottom window size of the overlap and enrichment functions
    pub top_k: usize,
    pub min_shared_genes: usize,
    /// disease genes with a significance value above this are not used in windows
    pub significance_cutoff: Option<f64>,
    pub gse_permutations: usize,
    pub gse_seed: u64,
    /// gene label permutations of the disease side pathway scores
    pub gsva_permutations: usize,
    /// disease pathways with a larger q-value are not compared
    pub gsva_q_cutoff: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        ScoringParams {
            top_k: 100,
            min_shared_genes: 10,
            significance_cutoff: None,
            gse_permutations: 1000,
            gse_seed: 666,
            gsva_permutations: 1000,
            gsva_q_cutoff: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringFunctionResult {
    pub function: ScoringFunction,
    pub score: f64,
    pub p_value: Option<f64>,
    /// genes of the comparison present in both profiles
    pub shared_genes: usize,
    /// a top/bottom window was shorter than `top_k`
    pub truncated: bool,
    pub backend: Option<String>,
}

/// Indices into a profile: most positive genes, most negative genes.
#[derive(Debug)]
struct Windows {
    up: Vec<usize>,
    down: Vec<usize>,
    truncated: bool,
}

impl Windows {
    fn new(profile: &Profile, k: usize, cutoff: Option<f64>) -> Self {
        let stats = profile.statistics();
        let eligible: Vec<usize> = match (profile.significance(), cutoff) {
            (Some(sig), Some(c)) => (0..stats.len()).filter(|&i| sig[i] <= c).collect(),
            _ => (0..stats.len()).collect(),
        };
        let values: Vec<f64> = eligible.iter().map(|&i| stats[i]).collect();
        let width = k.min(eligible.len());

        let (desc, _) = values.as_slice().argsort(false);
        let (asc, _) = values.as_slice().argsort(true);
        let up = desc[..width]
            .iter()
            .map(|&j| eligible[j])
            .filter(|&i| stats[i] > 0.0)
            .collect();
        let down = asc[..width]
            .iter()
            .map(|&j| eligible[j])
            .filter(|&i| stats[i] < 0.0)
            .collect();
        Windows {
            up,
            down,
            truncated: width < k,
        }
    }

    fn genes<'a>(&self, profile: &'a Profile, idx: &[usize]) -> Vec<&'a GeneId> {
        idx.iter().map(|&i| &profile.genes()[i]).collect()
    }

    /// genes and statistics of the up window followed by the down window
    fn extremes(&self, profile: &Profile) -> (Vec<GeneId>, Vec<f64>) {
        self.up
            .iter()
            .chain(self.down.iter())
            .map(|&i| (profile.genes()[i].clone(), profile.statistics()[i]))
            .unzip()
    }

    /// statistic of `gene` if it falls in one of the windows, else 0
    fn extreme(&self, profile: &Profile, gene: &GeneId) -> f64 {
        match profile.index_of(gene) {
            Some(i) if self.up.contains(&i) || self.down.contains(&i) => profile.statistics()[i],
            _ => 0.0,
        }
    }
}

/// Disease side pathway scores, kept with the window they were computed on.
struct CachedPathways {
    genes: Vec<GeneId>,
    values: Vec<f64>,
    kept: Arc<Vec<PathwayScore>>,
}

pub struct ScoringFunctionLibrary {
    functions: Vec<ScoringFunction>,
    params: ScoringParams,
    backend: Option<Arc<dyn GseBackend>>,
    gene_sets: Option<Arc<GeneSetCollection>>,
    gsva: Option<Gsva>,
    pathway_cache: Mutex<HashMap<String, CachedPathways>>,
}

impl ScoringFunctionLibrary {
    pub fn new(params: ScoringParams, backend: Option<Arc<dyn GseBackend>>) -> Self {
        ScoringFunctionLibrary {
            functions: ScoringFunction::DEFAULT.to_vec(),
            params,
            backend,
            gene_sets: None,
            gsva: None,
            pathway_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Gene set collection of the pathway-level functions.
    pub fn with_gene_sets(mut self, collection: Arc<GeneSetCollection>) -> Result<Self> {
        self.gsva = Some(Gsva::new()?);
        self.gene_sets = Some(collection);
        Ok(self)
    }

    /// Restrict the registry to `functions`, keeping their given order.
    pub fn with_functions(mut self, functions: &[ScoringFunction]) -> Self {
        let mut seen = HashSet::new();
        self.functions = functions.iter().copied().filter(|f| seen.insert(*f)).collect();
        self
    }

    pub fn functions(&self) -> &[ScoringFunction] {
        &self.functions
    }

    pub fn params(&self) -> &ScoringParams {
        &self.params
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub fn score(
        &self,
        function: ScoringFunction,
        perturbation: &Profile,
        disease: &Profile,
    ) -> Result<ScoringFunctionResult> {
        self.score_with(function, perturbation, disease, &CancelToken::new())
    }

    pub fn score_with(
        &self,
        function: ScoringFunction,
        perturbation: &Profile,
        disease: &Profile,
        cancel: &CancelToken,
    ) -> Result<ScoringFunctionResult> {
        if !self.functions.contains(&function) {
            return Err(ScoringError::NotFound(format!(
                "scoring function '{function}' is not registered"
            )));
        }
        match function.family() {
            Family::Overlap => Ok(self.overlap(function, perturbation, disease)),
            Family::Correlation => self.correlation(function, perturbation, disease),
            Family::GeneSetEnrichment => self.enrichment(function, perturbation, disease, cancel),
            Family::Pathway => self.pathway(function, perturbation, disease, cancel),
        }
    }

    fn overlap(
        &self,
        function: ScoringFunction,
        perturbation: &Profile,
        disease: &Profile,
    ) -> ScoringFunctionResult {
        let k = self.params.top_k;
        let dw = Windows::new(disease, k, self.params.significance_cutoff);
        let pw = Windows::new(perturbation, k, None);

        let score = match function {
            ScoringFunction::XSum => {
                let up: f64 = dw
                    .genes(disease, &dw.up)
                    .into_iter()
                    .map(|g| pw.extreme(perturbation, g))
                    .sum();
                let down: f64 = dw
                    .genes(disease, &dw.down)
                    .into_iter()
                    .map(|g| pw.extreme(perturbation, g))
                    .sum();
                up - down
            }
            _ => {
                let mut union: Vec<&GeneId> = dw.genes(disease, &dw.up);
                union.extend(dw.genes(disease, &dw.down));
                union.extend(pw.genes(perturbation, &pw.up));
                union.extend(pw.genes(perturbation, &pw.down));
                union.sort();
                union.dedup();
                let x: Vec<f64> = union.iter().map(|g| pw.extreme(perturbation, g)).collect();
                let y: Vec<f64> = union.iter().map(|g| dw.extreme(disease, g)).collect();
                cosine(&x, &y)
            }
        };

        let shared_genes = dw
            .up
            .iter()
            .chain(dw.down.iter())
            .filter(|&&i| perturbation.index_of(&disease.genes()[i]).is_some())
            .count();
        ScoringFunctionResult {
            function,
            score,
            p_value: None,
            shared_genes,
            truncated: dw.truncated || pw.truncated,
            backend: None,
        }
    }

    fn correlation(
        &self,
        function: ScoringFunction,
        perturbation: &Profile,
        disease: &Profile,
    ) -> Result<ScoringFunctionResult> {
        let (x, y): (Vec<f64>, Vec<f64>) = perturbation
            .genes()
            .iter()
            .zip(perturbation.statistics())
            .filter_map(|(g, &v)| disease.index_of(g).map(|j| (v, disease.statistics()[j])))
            .unzip();
        let shared = x.len();
        if shared < self.params.min_shared_genes {
            return Err(ScoringError::InsufficientOverlap {
                shared,
                required: self.params.min_shared_genes,
            });
        }
        let score = match function {
            ScoringFunction::Spearman => pearson(
                &x.as_slice().average_rank(),
                &y.as_slice().average_rank(),
            ),
            _ => pearson(&x, &y),
        }
        .ok_or_else(|| {
            ScoringError::UndefinedStatistic(format!(
                "{function}: zero variance over {shared} shared genes"
            ))
        })?;
        Ok(ScoringFunctionResult {
            function,
            score,
            p_value: None,
            shared_genes: shared,
            truncated: false,
            backend: None,
        })
    }

    fn enrichment(
        &self,
        function: ScoringFunction,
        perturbation: &Profile,
        disease: &Profile,
        cancel: &CancelToken,
    ) -> Result<ScoringFunctionResult> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| ScoringError::BackendUnavailable {
                backend: "none".to_string(),
                reason: format!("{function} requires a gene set enrichment backend"),
            })?;
        let k = self.params.top_k;
        let dw = Windows::new(disease, k, self.params.significance_cutoff);
        let pw_truncated = perturbation.len() < k;

        let to_set = |name: &str, idx: &[usize]| GeneSet {
            name: name.to_string(),
            genes: idx.iter().map(|&i| disease.genes()[i].clone()).collect(),
        };
        let mut gene_sets = Vec::with_capacity(2);
        if !dw.up.is_empty() {
            gene_sets.push(to_set("up", &dw.up));
        }
        if !dw.down.is_empty() {
            gene_sets.push(to_set("down", &dw.down));
        }
        let ranked = RankedList::from_profile(perturbation);
        let shared_genes: usize = gene_sets
            .iter()
            .map(|gs| ranked.hit_index(&gs.genes).len())
            .sum();
        let request = EnrichmentRequest {
            ranked,
            gene_sets,
            permutations: self.params.gse_permutations,
            seed: self.params.gse_seed,
        };
        // a disease profile without up or down genes scores 0 with p = 1
        let results = if request.gene_sets.is_empty() {
            Vec::new()
        } else {
            backend.enrich(&request, &CallGuard::new(None, cancel.clone()))?
        };
        if results.len() != request.gene_sets.len() {
            return Err(ScoringError::BackendFailed {
                backend: backend.name().to_string(),
                reason: format!(
                    "{} results for {} gene sets",
                    results.len(),
                    request.gene_sets.len()
                ),
            });
        }

        let mut es_up = 0.0;
        let mut es_down = 0.0;
        let mut pvals = Vec::with_capacity(2);
        for (gs, r) in request.gene_sets.iter().zip(results.iter()) {
            if gs.name == "up" {
                es_up = r.statistic;
            } else {
                es_down = r.statistic;
            }
            pvals.push(r.p_value);
        }
        let p_value = fisher_combine(&pvals);
        let diff = es_up - es_down;
        let score = match function {
            ScoringFunction::GseaConnectivity => {
                if es_up * es_down > 0.0 {
                    0.0
                } else {
                    diff / 2.0
                }
            }
            // reversal (diff < 0) scores high; the ES term keeps the
            // direction when p = 1
            _ => {
                if diff == 0.0 {
                    0.0
                } else {
                    -diff.signum() * (p_value.log10().abs() + diff.abs() / 2.0)
                }
            }
        };
        Ok(ScoringFunctionResult {
            function,
            score,
            p_value: Some(p_value),
            shared_genes,
            truncated: dw.truncated || pw_truncated,
            backend: Some(backend.name().to_string()),
        })
    }

    fn pathway(
        &self,
        function: ScoringFunction,
        perturbation: &Profile,
        disease: &Profile,
        cancel: &CancelToken,
    ) -> Result<ScoringFunctionResult> {
        let (collection, gsva) = match (&self.gene_sets, &self.gsva) {
            (Some(c), Some(g)) => (c, g),
            _ => {
                return Err(ScoringError::Config(format!(
                    "{function} requires a gene set collection"
                )))
            }
        };
        if cancel.is_cancelled() {
            return Err(ScoringError::Cancelled);
        }
        let k = self.params.top_k;
        let dw = Windows::new(disease, k, self.params.significance_cutoff);
        let pw = Windows::new(perturbation, k, None);

        let disease_sets = self.disease_pathways(gsva, collection, disease, &dw)?;
        let (genes, values) = pw.extremes(perturbation);
        // only the compound scores enter the comparison, no null needed
        let compound_sets = gsva.single_sample(&genes, &values, collection, 0, self.params.gse_seed)?;
        let score = combine_pathway_scores(&disease_sets, &compound_sets).ok_or_else(|| {
            ScoringError::UndefinedStatistic(format!(
                "{function}: no disease pathway of '{}' with q <= {}",
                collection.name(),
                self.params.gsva_q_cutoff
            ))
        })?;

        let shared_genes = dw
            .genes(disease, &dw.up)
            .into_iter()
            .chain(dw.genes(disease, &dw.down))
            .filter(|g| genes.contains(*g))
            .count();
        Ok(ScoringFunctionResult {
            function,
            score,
            p_value: None,
            shared_genes,
            truncated: dw.truncated || pw.truncated,
            backend: None,
        })
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, CachedPathways>> {
        self.pathway_cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pathways of the disease window passing the q-value cutoff, computed
    /// once per disease profile.
    fn disease_pathways(
        &self,
        gsva: &Gsva,
        collection: &GeneSetCollection,
        disease: &Profile,
        dw: &Windows,
    ) -> Result<Arc<Vec<PathwayScore>>> {
        let (genes, values) = dw.extremes(disease);
        if let Some(hit) = self.cache().get(disease.id()) {
            if hit.genes == genes && hit.values == values {
                return Ok(hit.kept.clone());
            }
        }
        let all = gsva.single_sample(
            &genes,
            &values,
            collection,
            self.params.gsva_permutations,
            self.params.gse_seed,
        )?;
        let n_all = all.len();
        let cutoff = self.params.gsva_q_cutoff;
        let kept: Vec<PathwayScore> = all
            .into_iter()
            .filter(|p| p.fdr.map_or(true, |q| q <= cutoff))
            .collect();
        tracing::debug!(
            disease = disease.id(),
            pathways = n_all,
            kept = kept.len(),
            "disease pathways"
        );
        let kept = Arc::new(kept);
        self.cache().insert(
            disease.id().to_string(),
            CachedPathways {
                genes,
                values,
                kept: kept.clone(),
            },
        );
        Ok(kept)
    }
}

fn cosine(x: &[f64], y: &[f64]) -> f64 {
    let dot: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let nx: f64 = x.iter().map(|a| a * a).sum::<f64>().sqrt();
    let ny: f64 = y.iter().map(|b| b * b).sum::<f64>().sqrt();
    if nx == 0.0 || ny == 0.0 {
        return 0.0;
    }
    (dot / (nx * ny)).clamp(-1.0, 1.0)
}

/// None when either side has zero variance
fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let mx = x.mean();
    let my = y.mean();
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::backend::PrerankBackend;

    fn profile(id: &str, pairs: &[(&str, f64)]) -> Profile {
        Profile::from_pairs(id, pairs.iter().map(|(g, v)| (*g, *v))).unwrap()
    }

    fn eight() -> Profile {
        profile(
            "p",
            &[
                ("g1", 4.0),
                ("g2", 3.0),
                ("g3", 2.0),
                ("g4", 1.0),
                ("g5", -1.0),
                ("g6", -2.0),
                ("g7", -3.0),
                ("g8", -4.0),
            ],
        )
    }

    fn params(k: usize, min_shared: usize) -> ScoringParams {
        ScoringParams {
            top_k: k,
            min_shared_genes: min_shared,
            significance_cutoff: None,
            gse_permutations: 200,
            gse_seed: 3,
            gsva_permutations: 200,
            gsva_q_cutoff: 0.1,
        }
    }

    fn library(k: usize, min_shared: usize) -> ScoringFunctionLibrary {
        let backend: Arc<dyn GseBackend> = Arc::new(PrerankBackend::new(1.0, 2).unwrap());
        ScoringFunctionLibrary::new(params(k, min_shared), Some(backend))
    }

    #[test]
    fn test_function_metadata() {
        assert_eq!("XSum".parse::<ScoringFunction>().unwrap(), ScoringFunction::XSum);
        assert!("nope".parse::<ScoringFunction>().is_err());
        assert!(ScoringFunction::GseaConnectivity.requires_backend());
        assert!(!ScoringFunction::Pearson.requires_backend());
        assert_eq!(ScoringFunction::GseaReversal.polarity(), Polarity::HigherIsStronger);
        assert_eq!(ScoringFunction::XCos.polarity(), Polarity::LowerIsStronger);
        assert_eq!("gsva".parse::<ScoringFunction>().unwrap(), ScoringFunction::Gsva);
        assert_eq!(ScoringFunction::Gsva.family(), Family::Pathway);
        assert!(!ScoringFunction::Gsva.requires_backend());
        assert!(!ScoringFunction::DEFAULT.contains(&ScoringFunction::Gsva));
        assert_eq!(
            ScoringFunctionLibrary::new(params(2, 3), None).functions(),
            &ScoringFunction::DEFAULT
        );
    }

    #[test]
    fn test_self_and_flipped_have_opposite_strength() {
        let cases = [
            (eight(), library(2, 3)),
            (profile("two", &[("g1", 2.0), ("g2", -1.0)]), library(3, 2)),
            (profile("one", &[("g1", 2.5)]), library(3, 2)),
        ];
        for (p, lib) in cases.iter() {
            let flipped = p.negated("flipped");
            for f in ScoringFunction::DEFAULT {
                // one gene has no variance
                if p.len() < 2 && f.family() == Family::Correlation {
                    continue;
                }
                let same = lib.score(f, p, p).unwrap();
                let anti = lib.score(f, p, &flipped).unwrap();
                let n = p.len();
                assert!(same.score.is_finite() && anti.score.is_finite(), "n={n} {f}");
                assert!(
                    same.score * anti.score < 0.0,
                    "n={n} {f}: {} vs {}",
                    same.score,
                    anti.score
                );
                let pol = f.polarity();
                assert!(pol.strength(anti.score) > pol.strength(same.score), "n={n} {f}");
            }
        }
    }

    #[test]
    fn test_reversal_keeps_direction_when_not_significant() {
        // two genes: every permutation is as extreme as the observed ES, p = 1
        let lib = library(3, 2);
        let p = profile("two", &[("g1", 2.0), ("g2", -1.0)]);
        let same = lib.score(ScoringFunction::GseaReversal, &p, &p).unwrap();
        let anti = lib
            .score(ScoringFunction::GseaReversal, &p, &p.negated("flipped"))
            .unwrap();
        assert!((same.p_value.unwrap() - 1.0).abs() < 1e-12);
        assert!((same.score + 1.0).abs() < 1e-12);
        assert!((anti.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_strength_has_one_zero() {
        for pol in [Polarity::LowerIsStronger, Polarity::HigherIsStronger] {
            assert!(pol.strength(0.0).is_sign_positive());
            assert!(pol.strength(-0.0).is_sign_positive());
            assert_eq!(pol.strength(0.0).total_cmp(&pol.strength(-0.0)), std::cmp::Ordering::Equal);
        }
    }

    #[test]
    fn test_single_gene_profile_overlap() {
        let lib = library(3, 3);
        let p = profile("one", &[("g1", 2.5)]);
        let flipped = p.negated("flipped");
        for f in [ScoringFunction::XSum, ScoringFunction::XCos] {
            let same = lib.score(f, &p, &p).unwrap();
            let anti = lib.score(f, &p, &flipped).unwrap();
            assert!(same.score > 0.0 && anti.score < 0.0, "{f}");
            assert!(same.truncated);
        }
    }

    #[test]
    fn test_mirror_profiles_top1_maximal_anticorrelation() {
        let lib = library(1, 2);
        let a = profile("A", &[("g1", 3.0), ("g2", 2.0), ("g3", -3.0), ("g4", -2.0)]);
        let b = profile("B", &[("g1", -3.0), ("g2", -2.0), ("g3", 3.0), ("g4", 2.0)]);
        let xcos = lib.score(ScoringFunction::XCos, &a, &b).unwrap();
        assert!((xcos.score + 1.0).abs() < 1e-12);
        // drug top gene g1 is the disease bottom gene and vice versa
        let xsum = lib.score(ScoringFunction::XSum, &a, &b).unwrap();
        assert!((xsum.score + 6.0).abs() < 1e-12);
        assert!(!xsum.truncated);
        assert_eq!(xsum.shared_genes, 2);
    }

    #[test]
    fn test_truncation_iff_profile_shorter_than_k() {
        let long = eight();
        let short = profile("s", &[("g1", 1.0), ("g8", -1.0), ("g3", 0.5)]);
        for (k, drug, disease, expected) in [
            (3, &long, &short, false),
            (4, &long, &short, true),
            (4, &short, &long, true),
            (8, &long, &long, false),
            (9, &long, &long, true),
        ] {
            let r = library(k, 2).score(ScoringFunction::XSum, drug, disease).unwrap();
            assert_eq!(r.truncated, expected, "k={k}");
        }
    }

    #[test]
    fn test_correlation_min_shared_genes() {
        let drug = eight();
        let disease = profile("d", &[("g1", 1.0), ("g2", 0.5), ("g3", -1.0), ("x", 9.0)]);
        for f in [ScoringFunction::Pearson, ScoringFunction::Spearman] {
            let err = library(2, 4).score(f, &drug, &disease).unwrap_err();
            assert!(matches!(
                err,
                ScoringError::InsufficientOverlap { shared: 3, required: 4 }
            ));
            let ok = library(2, 3).score(f, &drug, &disease).unwrap();
            assert_eq!(ok.shared_genes, 3);
            assert!(ok.score.is_finite());
        }
    }

    #[test]
    fn test_correlation_zero_variance_is_error() {
        let drug = profile("d", &[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let disease = profile("x", &[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let err = library(2, 3).score(ScoringFunction::Pearson, &drug, &disease).unwrap_err();
        assert!(matches!(err, ScoringError::UndefinedStatistic(_)));
    }

    #[test]
    fn test_spearman_is_rank_based() {
        let drug = profile("d", &[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 100.0)]);
        let disease = profile("x", &[("a", -1.0), ("b", -2.0), ("c", -3.0), ("d", -4.0)]);
        let r = library(2, 3).score(ScoringFunction::Spearman, &drug, &disease).unwrap();
        assert!((r.score + 1.0).abs() < 1e-12);
        let p = library(2, 3).score(ScoringFunction::Pearson, &drug, &disease).unwrap();
        assert!(p.score > -1.0 + 1e-6);
    }

    #[test]
    fn test_gse_without_backend_is_unavailable() {
        let lib = ScoringFunctionLibrary::new(params(2, 3), None);
        let p = eight();
        let err = lib.score(ScoringFunction::GseaConnectivity, &p, &p).unwrap_err();
        assert!(matches!(err, ScoringError::BackendUnavailable { .. }));
    }

    #[test]
    fn test_gse_deterministic_under_seed() {
        let lib = library(2, 3);
        let p = eight();
        let d = profile("d", &[("g8", 2.0), ("g2", 1.0), ("g1", -1.0), ("g5", -2.0)]);
        let a = lib.score(ScoringFunction::GseaReversal, &p, &d).unwrap();
        let b = lib.score(ScoringFunction::GseaReversal, &p, &d).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.backend.as_deref(), Some("prerank"));
        assert!(a.p_value.is_some());
    }

    #[test]
    fn test_gse_uses_injected_backend() {
        let stub = Arc::new(StubBackend::default());
        let backend: Arc<dyn GseBackend> = stub.clone();
        let lib = ScoringFunctionLibrary::new(params(2, 3), Some(backend));
        let p = eight();
        let r = lib.score(ScoringFunction::GseaConnectivity, &p, &p.negated("n")).unwrap();
        assert!(r.score < 0.0);
        assert_eq!(r.backend.as_deref(), Some("stub"));
        assert_eq!(stub.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_significance_cutoff_filters_disease_genes() {
        let drug = eight();
        let disease = Profile::new(
            "d",
            vec!["g1".into(), "g2".into(), "g8".into()],
            vec![5.0, 4.0, -3.0],
            Some(vec![0.5, 0.01, 0.01]),
        )
        .unwrap();
        let mut prm = params(1, 2);
        prm.significance_cutoff = Some(0.05);
        let lib = ScoringFunctionLibrary::new(prm, None);
        let r = lib.score(ScoringFunction::XSum, &drug, &disease).unwrap();
        // g1 is not significant: up window is g2, which is outside the drug's top-1
        assert!((r.score - (0.0 - (-4.0))).abs() < 1e-12);
    }

    #[test]
    fn test_unregistered_function() {
        let lib = library(2, 3).with_functions(&[ScoringFunction::XSum]);
        let p = eight();
        assert!(matches!(
            lib.score(ScoringFunction::Pearson, &p, &p),
            Err(ScoringError::NotFound(_))
        ));
    }

    fn pathways(names: &[(&str, &[&str])]) -> Arc<GeneSetCollection> {
        let sets = names
            .iter()
            .map(|(name, genes)| GeneSet {
                name: name.to_string(),
                genes: genes.iter().map(|g| g.to_string()).collect(),
            })
            .collect();
        Arc::new(GeneSetCollection::new("toy", sets))
    }

    fn gsva_library(q_cutoff: f64, collection: Arc<GeneSetCollection>) -> ScoringFunctionLibrary {
        let mut prm = params(2, 3);
        prm.gsva_q_cutoff = q_cutoff;
        ScoringFunctionLibrary::new(prm, None)
            .with_functions(&[ScoringFunction::Gsva])
            .with_gene_sets(collection)
            .unwrap()
    }

    #[test]
    fn test_gsva_pathway_scores() {
        let collection = pathways(&[
            ("UP", &["g1", "g2"]),
            ("DOWN", &["g7", "g8"]),
            ("MIXED", &["g1", "g8"]),
        ]);
        let lib = gsva_library(0.1, collection.clone());
        let p = eight();
        let same = lib.score(ScoringFunction::Gsva, &p, &p).unwrap();
        let anti = lib.score(ScoringFunction::Gsva, &p.negated("n"), &p).unwrap();
        // UP and DOWN pass the q-value cutoff with scores 2 and -2, MIXED does not
        assert!((same.score - 4.0).abs() < 1e-9);
        assert!((anti.score + 4.0).abs() < 1e-9);
        assert_eq!(same.shared_genes, 4);
        assert_eq!(same.backend, None);

        let unfiltered = gsva_library(1.0, collection);
        let all = unfiltered.score(ScoringFunction::Gsva, &p, &p).unwrap();
        assert!((all.score - 8.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_gsva_needs_significant_disease_pathway() {
        let lib = gsva_library(0.1, pathways(&[("MIXED", &["g1", "g8"])]));
        let p = eight();
        assert!(matches!(
            lib.score(ScoringFunction::Gsva, &p, &p),
            Err(ScoringError::UndefinedStatistic(_))
        ));
    }

    #[test]
    fn test_gsva_without_collection() {
        let lib = library(2, 3).with_functions(&[ScoringFunction::Gsva]);
        let p = eight();
        let err = lib.score(ScoringFunction::Gsva, &p, &p).unwrap_err();
        assert!(matches!(err, ScoringError::Config(_)));
    }
}
