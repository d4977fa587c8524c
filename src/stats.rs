use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::utils::Statistic;

/// Enrichment of one gene set against one ranked list, with its gene
/// permutation null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub term: String,
    pub es: f64,
    pub nes: f64,
    pub pval: f64, // Nominal Pvalue
    pub hits: Vec<usize>, // positions of matched genes in the ranked list
    pub esnull: Vec<f64>,
}

impl EnrichmentSummary {
    pub fn new(term: &str, es: f64, hits: Vec<usize>, esnull: Vec<f64>) -> Self {
        let mut summary = EnrichmentSummary {
            term: term.to_string(),
            es,
            nes: 0.0,
            pval: 1.0,
            hits,
            esnull,
        };
        summary.pval();
        summary.normalize();
        summary
    }

    /// NES: es divided by the mean of the same-signed null values.
    pub fn normalize(&mut self) -> Vec<f64> {
        let e: f64 = self.es;
        let tmp: Vec<f64> = if e >= 0.0 {
            self.esnull.iter().copied().filter(|&x| x >= 0.0).collect()
        } else {
            self.esnull.iter().copied().filter(|&x| x < 0.0).collect()
        };

        // An extremely skewed null (es = -27, esnull = [13, 24, 57, 88]) has no
        // same-signed values; fall back to es itself so nes stays finite.
        let n_mean = if !tmp.is_empty() {
            tmp.iter().sum::<f64>() / (tmp.len() as f64)
        } else {
            e
        };
        if n_mean == 0.0 {
            self.nes = 0.0;
            return vec![0.0; self.esnull.len()];
        }
        self.nes = if e >= 0.0 { e / n_mean } else { -1.0 * e / n_mean };

        self.esnull
            .iter()
            .map(|&e| if e >= 0.0 { e / n_mean } else { -1.0 * e / n_mean })
            .collect()
    }

    /// Nominal p-value against the same-signed part of the null. One
    /// pseudo-count is added to both counts so that p is never zero.
    pub fn pval(&mut self) {
        let deno: usize;
        let nomi: usize;
        if self.es < 0.0 {
            deno = self.esnull.iter().filter(|&x| *x < 0.0).count();
            nomi = self.esnull.iter().filter(|&x| x <= &self.es).count();
        } else {
            deno = self.esnull.iter().filter(|&x| *x >= 0.0).count();
            nomi = self.esnull.iter().filter(|&x| x >= &self.es).count();
        }
        if deno == 0 {
            self.pval = 1.0;
            return;
        }
        self.pval = ((nomi + 1) as f64) / ((deno + 1) as f64);
    }
}

/// Fisher's method: -2 sum(ln p) ~ chi-squared with 2m degrees of freedom.
/// Empty input combines to 1.
pub fn fisher_combine(pvals: &[f64]) -> f64 {
    if pvals.is_empty() {
        return 1.0;
    }
    if pvals.len() == 1 {
        return pvals[0].clamp(f64::MIN_POSITIVE, 1.0);
    }
    let x: f64 = pvals
        .iter()
        .map(|p| -2.0 * p.clamp(f64::MIN_POSITIVE, 1.0).ln())
        .sum();
    let df = 2.0 * pvals.len() as f64;
    match ChiSquared::new(df) {
        Ok(chi) => chi.sf(x).clamp(f64::MIN_POSITIVE, 1.0),
        Err(_) => 1.0,
    }
}

/// Benjamini-Hochberg adjusted p-values, in input order.
pub fn adjust_bh(pvals: &[f64]) -> Vec<f64> {
    let m = pvals.len();
    let (order, sorted) = pvals.argsort(true);
    let mut adjusted = vec![1.0; m];
    let mut running = 1.0_f64;
    for rank in (0..m).rev() {
        let q = sorted[rank] * m as f64 / (rank + 1) as f64;
        running = running.min(q);
        adjusted[order[rank]] = running.clamp(0.0, 1.0);
    }
    adjusted
}
