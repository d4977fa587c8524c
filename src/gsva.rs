//! Single-sample GSVA for pathway-level scoring.
//!
//! The extreme genes of a profile form a two column matrix: the profile
//! statistic and a zero control. Gene-wise cumulative densities are estimated
//! with a Gaussian kernel and turned into symmetric rank scores per column,
//! then each gene set gets a KS-like running sum per column. The pathway
//! score is the condition column minus the control column. Gene label
//! permutations give a nominal p-value and a BH q-value per set.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::algorithm::EnrichmentScore;
use crate::backend::GeneSet;
use crate::error::{Result, ScoringError};
use crate::profile::GeneId;
use crate::stats::adjust_bh;
use crate::utils::{DynamicEnum, Statistic};

/// Named gene sets, e.g. the content of one GMT file.
#[derive(Debug, Clone)]
pub struct GeneSetCollection {
    name: String,
    sets: Vec<GeneSet>,
}

impl GeneSetCollection {
    pub fn new(name: &str, sets: Vec<GeneSet>) -> Self {
        GeneSetCollection {
            name: name.to_string(),
            sets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sets(&self) -> &[GeneSet] {
        &self.sets
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathwayScore {
    pub term: String,
    /// condition minus control enrichment
    pub nes: f64,
    pub p_value: Option<f64>,
    pub fdr: Option<f64>,
}

pub struct Gsva {
    tau: f64,
    mx_diff: bool,
    pre_res: usize,
    max_pre: usize,
    sigma: f64,
    pre_cdf: Vec<f64>,
}

impl Gsva {
    /// tau 1, max difference statistic
    pub fn new() -> Result<Self> {
        Self::with_options(1.0, true)
    }

    pub fn with_options(tau: f64, mx_diff: bool) -> Result<Self> {
        let pre_res: usize = 10000;
        let max_pre: usize = 10;
        let norm = Normal::new(0.0, 1.0)
            .map_err(|e| ScoringError::Config(format!("gsva kernel: {e}")))?;
        // https://github.com/rcastelo/GSVA/blob/devel/src/kernel_estimation.c
        let divisor = pre_res as f64;
        let pre_cdf = (0..=pre_res)
            .map(|i| norm.cdf(((i * max_pre) as f64) / divisor))
            .collect();
        Ok(Gsva {
            tau,
            mx_diff,
            pre_res,
            max_pre,
            sigma: 4.0,
            pre_cdf,
        })
    }

    fn precomputed_cdf(&self, x: f64, bw: f64) -> f64 {
        let v = x / bw;
        let max_precompute = self.max_pre as f64;
        if v < -max_precompute {
            0.0
        } else if v > max_precompute {
            1.0
        } else {
            let idx = (v.abs() / max_precompute * self.pre_res as f64) as usize;
            let cdf = self.pre_cdf[idx.min(self.pre_res)];
            if v < 0.0 {
                1.0 - cdf
            } else {
                cdf
            }
        }
    }

    /// kernel estimate for one gene over its samples; a constant gene has no
    /// bandwidth and gets density 0 everywhere
    fn row_density(&self, x: &[f64]) -> Vec<f64> {
        let bw = x.stat(1).1 / self.sigma;
        if !(bw > 0.0) {
            return vec![0.0; x.len()];
        }
        let size = x.len() as f64;
        x.iter()
            .map(|&yj| {
                let left_tail = x
                    .iter()
                    .map(|&xi| self.precomputed_cdf(yj - xi, bw))
                    .sum::<f64>()
                    / size;
                -1.0 * ((1.0 - left_tail) / left_tail).ln()
            })
            .collect()
    }

    /// mat: [n_genes, n_samples] -> gene density [n_genes, n_samples]
    pub fn density(&self, mat: &[Vec<f64>]) -> Vec<Vec<f64>> {
        mat.par_iter().map(|row| self.row_density(row)).collect()
    }

    /// Per sample: symmetric rank score of every gene (original gene order)
    /// and the genes sorted by decreasing density.
    pub fn rank_scores(&self, density: &[Vec<f64>]) -> (Vec<Vec<f64>>, Vec<Vec<usize>>) {
        let n_genes = density.len();
        let n_samples = density.first().map_or(0, |g| g.len());
        // R code: tmp[sort_idx_vec] <- abs(seq(from=num_genes,to=1) - num_genes/2)
        let rev_idx: Vec<f64> = (1..=n_genes)
            .rev()
            .map(|v| ((v as f64) - (n_genes as f64) / 2.0).abs())
            .collect();
        (0..n_samples)
            .into_par_iter()
            .map(|sample_idx| {
                let sample: Vec<f64> = density.iter().map(|gene| gene[sample_idx]).collect();
                let (sorted_idx, _) = sample.as_slice().argsort(false);
                let mut tmp = vec![0.0; n_genes];
                sorted_idx.iter().enumerate().for_each(|(i, &j)| {
                    tmp[j] = rev_idx[i];
                });
                (tmp, sorted_idx)
            })
            .unzip()
    }

    fn ks_sample(&self, rank_score: &[f64], sidx: &[usize], mask: &[bool], fset: &[usize]) -> f64 {
        let n_genes = rank_score.len();
        let n_fset = fset.len();
        let sum_gset: f64 = fset.iter().map(|&i| rank_score[i].powf(self.tau)).sum();
        if sum_gset <= 0.0 {
            return 0.0;
        }
        let dec = if n_genes > n_fset {
            1.0 / ((n_genes - n_fset) as f64)
        } else {
            0.0
        };

        let mut cum_sum = 0.0;
        let mut mx_pos = 0.0;
        let mut mx_neg = 0.0;
        for &idx in sidx {
            if mask[idx] {
                cum_sum += rank_score[idx].powf(self.tau) / sum_gset;
            } else {
                cum_sum -= dec;
            }
            if cum_sum > mx_pos {
                mx_pos = cum_sum;
            }
            if cum_sum < mx_neg {
                mx_neg = cum_sum;
            }
        }
        if self.mx_diff {
            mx_pos + mx_neg
        } else if mx_pos > f64::abs(mx_neg) {
            mx_pos
        } else {
            mx_neg
        }
    }

    /// enrichment of `fset` (gene indices) in every sample
    pub fn enrichment(&self, rank_scores: &[Vec<f64>], sidxs: &[Vec<usize>], fset: &[usize]) -> Vec<f64> {
        let n_genes = rank_scores.first().map_or(0, |s| s.len());
        let mut mask = vec![false; n_genes];
        fset.iter().for_each(|&i| mask[i] = true);
        rank_scores
            .iter()
            .zip(sidxs.iter())
            .map(|(scores, idx)| self.ks_sample(scores, idx, &mask, fset))
            .collect()
    }

    /// Pathway scores of one profile restricted to `genes`. Sets sharing
    /// fewer than two genes with the profile are left out. Without
    /// permutations p-values and q-values are `None`.
    pub fn single_sample(
        &self,
        genes: &[GeneId],
        values: &[f64],
        collection: &GeneSetCollection,
        permutations: usize,
        seed: u64,
    ) -> Result<Vec<PathwayScore>> {
        if genes.is_empty() {
            return Ok(Vec::new());
        }
        let index = DynamicEnum::try_from_slice(genes)
            .map_err(|g| ScoringError::malformed(collection.name(), format!("duplicated gene '{g}'")))?;
        let mat: Vec<Vec<f64>> = values.iter().map(|&v| vec![v, 0.0]).collect();
        let (scores, sidxs) = self.rank_scores(&self.density(&mat));

        let hit_sets: Vec<(&str, Vec<usize>)> = collection
            .sets()
            .iter()
            .filter_map(|gs| {
                let mut hits: Vec<usize> = index.index_of_any(&gs.genes).into_iter().copied().collect();
                hits.sort_unstable();
                hits.dedup();
                (hits.len() > 1).then_some((gs.name.as_str(), hits))
            })
            .collect();
        let difference = |hits: &[usize]| {
            let es = self.enrichment(&scores, &sidxs, hits);
            es[0] - es[1]
        };
        let observed: Vec<f64> = hit_sets
            .par_iter()
            .map(|(_, hits)| difference(hits.as_slice()))
            .collect();

        if permutations == 0 {
            return Ok(hit_sets
                .iter()
                .zip(observed)
                .map(|((term, _), nes)| PathwayScore {
                    term: term.to_string(),
                    nes,
                    p_value: None,
                    fdr: None,
                })
                .collect());
        }

        // gene labels are shuffled, the matrix stays
        let gperm = EnrichmentScore::new(genes.len(), permutations, seed).gene_permutation(permutations);
        let pvals: Vec<f64> = hit_sets
            .par_iter()
            .zip(observed.par_iter())
            .map(|((_, hits), &obs)| {
                let extreme = gperm
                    .iter()
                    .filter(|perm| {
                        let shuffled: Vec<usize> = hits.iter().map(|&i| perm[i]).collect();
                        let random = difference(shuffled.as_slice());
                        if obs >= 0.0 {
                            random > obs
                        } else {
                            random < obs
                        }
                    })
                    .count();
                extreme as f64 / permutations as f64
            })
            .collect();
        let fdrs = adjust_bh(&pvals);

        Ok(hit_sets
            .iter()
            .zip(observed)
            .zip(pvals.into_iter().zip(fdrs))
            .map(|(((term, _), nes), (p, q))| PathwayScore {
                term: term.to_string(),
                nes,
                p_value: Some(p),
                fdr: Some(q),
            })
            .collect())
    }
}

/// Mean over the disease pathways of disease score times compound score.
/// Pathways the compound has no score for count as 0. `None` without disease
/// pathways.
pub fn combine_pathway_scores(disease: &[PathwayScore], compound: &[PathwayScore]) -> Option<f64> {
    if disease.is_empty() {
        return None;
    }
    let by_term: HashMap<&str, f64> = compound.iter().map(|p| (p.term.as_str(), p.nes)).collect();
    let total: f64 = disease
        .iter()
        .map(|d| d.nes * by_term.get(d.term.as_str()).copied().unwrap_or(0.0))
        .sum();
    Some(total / disease.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(name: &str, genes: &[&str]) -> GeneSet {
        GeneSet {
            name: name.to_string(),
            genes: genes.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn collection() -> GeneSetCollection {
        GeneSetCollection::new(
            "toy",
            vec![
                set("UP", &["g1", "g2", "x1"]),
                set("DOWN", &["g3", "g4"]),
                set("MIXED", &["g1", "g3"]),
                set("SINGLE", &["g1", "x2"]),
            ],
        )
    }

    fn genes() -> Vec<GeneId> {
        ["g1", "g2", "g3", "g4"].iter().map(|g| g.to_string()).collect()
    }

    #[test]
    fn test_kernel_density_sign() {
        let gsva = Gsva::new().unwrap();
        let d = gsva.density(&[vec![2.0, 0.0], vec![-0.5, 0.0], vec![1.0, 1.0]]);
        // two samples: left tails 3/4 and 1/4
        assert!((d[0][0] - 3f64.ln()).abs() < 1e-6);
        assert!((d[0][1] + 3f64.ln()).abs() < 1e-6);
        assert!((d[1][0] + 3f64.ln()).abs() < 1e-6);
        assert_eq!(d[2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_rank_scores_symmetric() {
        let gsva = Gsva::new().unwrap();
        let density = vec![vec![4.0], vec![3.0], vec![2.0], vec![1.0]];
        let (scores, sidx) = gsva.rank_scores(&density);
        assert_eq!(sidx[0], vec![0, 1, 2, 3]);
        assert_eq!(scores[0], vec![2.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_single_sample_directions() {
        let gsva = Gsva::new().unwrap();
        let out = gsva
            .single_sample(&genes(), &[2.0, 1.0, -1.0, -2.0], &collection(), 0, 1)
            .unwrap();
        let terms: Vec<&str> = out.iter().map(|p| p.term.as_str()).collect();
        assert_eq!(terms, vec!["UP", "DOWN", "MIXED"]);
        assert!((out[0].nes - 2.0).abs() < 1e-9);
        assert!((out[1].nes + 2.0).abs() < 1e-9);
        assert!(out[2].nes.abs() < 1e-9);
        assert!(out.iter().all(|p| p.p_value.is_none() && p.fdr.is_none()));
    }

    #[test]
    fn test_single_sample_permutations() {
        let gsva = Gsva::new().unwrap();
        let values = [2.0, 1.0, -1.0, -2.0];
        let a = gsva.single_sample(&genes(), &values, &collection(), 200, 5).unwrap();
        let b = gsva.single_sample(&genes(), &values, &collection(), 200, 5).unwrap();
        assert_eq!(a, b);
        // nothing beats the maximal up and down sets
        assert_eq!(a[0].p_value, Some(0.0));
        assert_eq!(a[1].p_value, Some(0.0));
        // a third of the random pairs score above 0
        assert!(a[2].p_value.unwrap() > 0.15);
        assert!(a[2].fdr.unwrap() >= a[2].p_value.unwrap());
    }

    #[test]
    fn test_combine_pathway_scores() {
        let score = |term: &str, nes: f64| PathwayScore {
            term: term.to_string(),
            nes,
            p_value: None,
            fdr: None,
        };
        let disease = vec![score("A", 2.0), score("B", -1.0)];
        let compound = vec![score("B", 1.0), score("C", 5.0)];
        // A missing on the compound side: (2 * 0 + -1 * 1) / 2
        assert_eq!(combine_pathway_scores(&disease, &compound), Some(-0.5));
        assert_eq!(combine_pathway_scores(&[], &compound), None);
    }
}
