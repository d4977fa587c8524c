use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoringError};
use crate::scoring::{Family, ScoringFunction, ScoringParams};

/// Every option of a scoring and evaluation run. Missing keys in a JSON
/// config file take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub top_k: usize,
    pub min_shared_genes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub significance_cutoff: Option<f64>,
    pub gse_permutations: usize,
    pub gse_seed: u64,
    /// exponent of the running-sum weight, 1 = classic weighted GSEA
    pub gse_weight: f64,
    pub baseline_permutations: usize,
    pub baseline_seed: u64,
    /// parallel (context, function) units
    pub concurrency: usize,
    /// parallel calls into the enrichment backend
    pub backend_concurrency: usize,
    /// threads of the in-process enrichment pool
    pub backend_threads: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_timeout_secs: Option<f64>,
    pub functions: Vec<ScoringFunction>,
    /// GMT collection of the pathway-level functions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gene_sets: Option<PathBuf>,
    pub gsva_permutations: usize,
    pub gsva_q_cutoff: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        let scoring = ScoringParams::default();
        RunConfig {
            top_k: scoring.top_k,
            min_shared_genes: scoring.min_shared_genes,
            significance_cutoff: scoring.significance_cutoff,
            gse_permutations: scoring.gse_permutations,
            gse_seed: scoring.gse_seed,
            gse_weight: 1.0,
            baseline_permutations: 1000,
            baseline_seed: 666,
            concurrency: 1,
            backend_concurrency: 1,
            backend_threads: 1,
            backend_timeout_secs: None,
            functions: ScoringFunction::DEFAULT.to_vec(),
            gene_sets: None,
            gsva_permutations: scoring.gsva_permutations,
            gsva_q_cutoff: scoring.gsva_q_cutoff,
        }
    }
}

impl RunConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: RunConfig = serde_json::from_reader(reader)
            .map_err(|e| ScoringError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(ScoringError::Config(msg.to_string()));
        if self.top_k == 0 {
            return bad("top_k must be at least 1");
        }
        if self.min_shared_genes < 2 {
            return bad("min_shared_genes must be at least 2");
        }
        if let Some(c) = self.significance_cutoff {
            if !(0.0..=1.0).contains(&c) {
                return bad("significance_cutoff must lie in [0, 1]");
            }
        }
        if !self.gse_weight.is_finite() || self.gse_weight < 0.0 {
            return bad("gse_weight must be a non-negative number");
        }
        if self.concurrency == 0 || self.backend_concurrency == 0 || self.backend_threads == 0 {
            return bad("concurrency limits must be at least 1");
        }
        if let Some(t) = self.backend_timeout_secs {
            if !t.is_finite() || t <= 0.0 {
                return bad("backend_timeout_secs must be positive");
            }
        }
        if self.functions.is_empty() {
            return bad("no scoring function selected");
        }
        if !(self.gsva_q_cutoff > 0.0 && self.gsva_q_cutoff <= 1.0) {
            return bad("gsva_q_cutoff must lie in (0, 1]");
        }
        if self.needs_gene_sets() && self.gene_sets.is_none() {
            return bad("gsva needs a gene set collection (gene_sets)");
        }
        Ok(())
    }

    pub fn scoring_params(&self) -> ScoringParams {
        ScoringParams {
            top_k: self.top_k,
            min_shared_genes: self.min_shared_genes,
            significance_cutoff: self.significance_cutoff,
            gse_permutations: self.gse_permutations,
            gse_seed: self.gse_seed,
            gsva_permutations: self.gsva_permutations,
            gsva_q_cutoff: self.gsva_q_cutoff,
        }
    }

    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn needs_backend(&self) -> bool {
        self.functions.iter().any(|f| f.requires_backend())
    }

    pub fn needs_gene_sets(&self) -> bool {
        self.functions.iter().any(|f| f.family() == Family::Pathway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: RunConfig =
            serde_json::from_str(r#"{"top_k": 50, "functions": ["xsum", "gsea_reversal"]}"#)
                .unwrap();
        assert_eq!(cfg.top_k, 50);
        assert_eq!(cfg.min_shared_genes, 10);
        assert_eq!(
            cfg.functions,
            vec![ScoringFunction::XSum, ScoringFunction::GseaReversal]
        );
        assert!(cfg.needs_backend());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = RunConfig {
            top_k: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ScoringError::Config(_))));
        cfg.top_k = 5;
        cfg.concurrency = 0;
        assert!(cfg.validate().is_err());
        cfg.concurrency = 2;
        cfg.backend_timeout_secs = Some(-1.0);
        assert!(cfg.validate().is_err());
        cfg.backend_timeout_secs = Some(1.5);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.backend_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_unknown_function_name_fails() {
        let r: std::result::Result<RunConfig, _> =
            serde_json::from_str(r#"{"functions": ["mroast"]}"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_gsva_requires_gene_sets() {
        let mut cfg: RunConfig = serde_json::from_str(r#"{"functions": ["xsum", "gsva"]}"#).unwrap();
        assert!(cfg.needs_gene_sets());
        assert!(!cfg.needs_backend());
        assert!(matches!(cfg.validate(), Err(ScoringError::Config(_))));
        cfg.gene_sets = Some(PathBuf::from("tests/data/pathways.gmt"));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scoring_params().gsva_q_cutoff, 0.1);
        cfg.gsva_q_cutoff = 0.0;
        assert!(cfg.validate().is_err());
    }
}
