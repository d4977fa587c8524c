//! Ranking drugs for one (scoring function, disease context) unit and
//! measuring how well the ranking separates indicated from contraindicated
//! drugs.
//!
//! A unit walks `Idle -> RankingComputed -> MetricComputed ->
//! BaselineComputed -> Done`. [`ContextEvaluation`] exposes the steps one by
//! one; [`EvaluationHarness::evaluate`] drives all of them.

use std::fmt;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backend::CancelToken;
use crate::error::{Result, ScoringError};
use crate::labels::{Label, LabelSet};
use crate::profile::{DiseaseContext, SignatureStore};
use crate::scoring::{Polarity, ScoringFunction, ScoringFunctionLibrary, ScoringFunctionResult};
use crate::strata::StratificationManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub baseline_permutations: usize,
    pub baseline_seed: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            baseline_permutations: 1000,
            baseline_seed: 666,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStage {
    Idle,
    RankingComputed,
    MetricComputed,
    BaselineComputed,
    Done,
}

impl fmt::Display for EvaluationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvaluationStage::Idle => "idle",
            EvaluationStage::RankingComputed => "ranking_computed",
            EvaluationStage::MetricComputed => "metric_computed",
            EvaluationStage::BaselineComputed => "baseline_computed",
            EvaluationStage::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDrug {
    pub drug: String,
    pub score: f64,
    pub p_value: Option<f64>,
    pub label: Label,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationBaseline {
    pub permutations: usize,
    pub seed: u64,
    pub null: Vec<f64>,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub context: DiseaseContext,
    pub function: ScoringFunction,
    pub polarity: Polarity,
    /// rank 1 first
    pub ranking: Vec<RankedDrug>,
    pub observed_auc: f64,
    pub baseline: PermutationBaseline,
    pub n_labeled: usize,
    pub truncated_drugs: usize,
    pub backend: Option<String>,
}

/// Strongest first, equal strength by drug id ascending.
fn sort_ranking(ranking: &mut [RankedDrug], polarity: Polarity) {
    ranking.sort_by(|a, b| {
        polarity
            .strength(b.score)
            .total_cmp(&polarity.strength(a.score))
            .then_with(|| a.drug.cmp(&b.drug))
    });
}

/// ROC AUC of `labels` given in rank order (strongest first): the share of
/// (indicated, contraindicated) pairs where the indicated drug ranks higher.
/// Unknown entries are skipped. None without both classes.
pub fn rank_auc(labels: &[Label]) -> Option<f64> {
    let mut pos_seen = 0usize;
    let mut n_neg = 0usize;
    let mut concordant = 0usize;
    for l in labels.iter() {
        match l {
            Label::Indicated => pos_seen += 1,
            Label::Contraindicated => {
                n_neg += 1;
                concordant += pos_seen;
            }
            Label::Unknown => {}
        }
    }
    if pos_seen == 0 || n_neg == 0 {
        return None;
    }
    Some(concordant as f64 / (pos_seen * n_neg) as f64)
}

pub struct EvaluationHarness {
    store: Arc<SignatureStore>,
    strata: Arc<StratificationManager>,
    labels: Arc<LabelSet>,
    library: Arc<ScoringFunctionLibrary>,
    config: HarnessConfig,
}

impl EvaluationHarness {
    pub fn new(
        store: Arc<SignatureStore>,
        strata: Arc<StratificationManager>,
        labels: Arc<LabelSet>,
        library: Arc<ScoringFunctionLibrary>,
        config: HarnessConfig,
    ) -> Self {
        EvaluationHarness {
            store,
            strata,
            labels,
            library,
            config,
        }
    }

    pub fn library(&self) -> &ScoringFunctionLibrary {
        &self.library
    }

    pub fn strata(&self) -> &StratificationManager {
        &self.strata
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn begin(&self, function: ScoringFunction, context: DiseaseContext) -> ContextEvaluation<'_> {
        ContextEvaluation {
            harness: self,
            function,
            context,
            stage: EvaluationStage::Idle,
            ranking: Vec::new(),
            observed: None,
            baseline: None,
        }
    }

    pub fn evaluate(
        &self,
        function: ScoringFunction,
        context: &DiseaseContext,
        cancel: &CancelToken,
    ) -> Result<EvaluationOutcome> {
        let mut unit = self.begin(function, context.clone());
        unit.compute_ranking(cancel)?;
        unit.compute_metric()?;
        unit.compute_baseline()?;
        unit.finish()
    }
}

/// One unit in progress. A failed step leaves the stage unchanged, so the
/// unit cannot be continued past it.
pub struct ContextEvaluation<'h> {
    harness: &'h EvaluationHarness,
    function: ScoringFunction,
    context: DiseaseContext,
    stage: EvaluationStage,
    ranking: Vec<RankedDrug>,
    observed: Option<f64>,
    baseline: Option<PermutationBaseline>,
}

impl ContextEvaluation<'_> {
    pub fn stage(&self) -> EvaluationStage {
        self.stage
    }

    pub fn ranking(&self) -> &[RankedDrug] {
        &self.ranking
    }

    fn advance(&mut self, from: EvaluationStage, to: EvaluationStage) -> Result<()> {
        if self.stage != from {
            return Err(ScoringError::InvalidTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Score every drug in the store and order them strongest first. Equal
    /// strength is broken by drug id ascending.
    pub fn compute_ranking(&mut self, cancel: &CancelToken) -> Result<()> {
        self.advance(EvaluationStage::Idle, EvaluationStage::RankingComputed)?;
        if cancel.is_cancelled() {
            return Err(ScoringError::Cancelled);
        }
        let h = self.harness;
        let disease = h.strata.profile_for(&self.context)?;
        let drugs: Vec<&str> = h.store.drugs().collect();
        let score_one = |drug: &str| -> Result<(String, ScoringFunctionResult)> {
            let perturbation = h.store.get_perturbation_profile(drug)?;
            let r = h
                .library
                .score_with(self.function, perturbation, disease, cancel)?;
            Ok((drug.to_string(), r))
        };
        // backend calls are metered by the backend's own permit pool
        let scored: Vec<(String, ScoringFunctionResult)> = if self.function.requires_backend() {
            drugs.iter().map(|&d| score_one(d)).collect::<Result<_>>()?
        } else {
            drugs.par_iter().map(|&d| score_one(d)).collect::<Result<_>>()?
        };

        let polarity = self.function.polarity();
        let mut ranking: Vec<RankedDrug> = scored
            .into_iter()
            .map(|(drug, r)| RankedDrug {
                label: h.labels.label(&self.context, &drug),
                drug,
                score: r.score,
                p_value: r.p_value,
                truncated: r.truncated,
            })
            .collect();
        sort_ranking(&mut ranking, polarity);
        tracing::debug!(
            context = %self.context,
            function = %self.function,
            drugs = ranking.len(),
            "ranking computed"
        );
        self.ranking = ranking;
        self.stage = EvaluationStage::RankingComputed;
        Ok(())
    }

    fn labeled(&self) -> Vec<Label> {
        self.ranking
            .iter()
            .map(|r| r.label)
            .filter(|l| l.is_known())
            .collect()
    }

    pub fn compute_metric(&mut self) -> Result<()> {
        self.advance(EvaluationStage::RankingComputed, EvaluationStage::MetricComputed)?;
        let labeled = self.labeled();
        let n_pos = labeled.iter().filter(|l| **l == Label::Indicated).count();
        let n_neg = labeled.len() - n_pos;
        let auc = rank_auc(&labeled).ok_or_else(|| ScoringError::DegenerateLabelSet {
            context: self.context.to_string(),
            reason: format!("{n_pos} indicated and {n_neg} contraindicated drugs ranked"),
        })?;
        self.observed = Some(auc);
        self.stage = EvaluationStage::MetricComputed;
        Ok(())
    }

    /// Shuffle the labels of the labeled drugs over their ranked positions.
    /// The p-value counts permuted AUCs at least as far from 0.5 on the
    /// observed side.
    pub fn compute_baseline(&mut self) -> Result<()> {
        self.advance(EvaluationStage::MetricComputed, EvaluationStage::BaselineComputed)?;
        let observed = self.observed.unwrap_or(0.5);
        let cfg = &self.harness.config;
        let labeled = self.labeled();

        let mut rng = SmallRng::seed_from_u64(cfg.baseline_seed);
        let shuffles: Vec<Vec<Label>> = (0..cfg.baseline_permutations)
            .map(|_| {
                let mut l = labeled.clone();
                l.shuffle(&mut rng);
                l
            })
            .collect();
        let null: Vec<f64> = shuffles
            .par_iter()
            .map(|l| rank_auc(l).unwrap_or(0.5))
            .collect();

        let p_value = if null.is_empty() {
            1.0
        } else {
            let extreme = if observed >= 0.5 {
                null.iter().filter(|&&x| x >= observed).count()
            } else {
                null.iter().filter(|&&x| x <= observed).count()
            };
            extreme as f64 / null.len() as f64
        };
        self.baseline = Some(PermutationBaseline {
            permutations: cfg.baseline_permutations,
            seed: cfg.baseline_seed,
            null,
            p_value,
        });
        self.stage = EvaluationStage::BaselineComputed;
        Ok(())
    }

    pub fn finish(mut self) -> Result<EvaluationOutcome> {
        self.advance(EvaluationStage::BaselineComputed, EvaluationStage::Done)?;
        self.stage = EvaluationStage::Done;
        let (Some(observed_auc), Some(baseline)) = (self.observed, self.baseline.take()) else {
            return Err(ScoringError::InvalidTransition {
                from: EvaluationStage::BaselineComputed.to_string(),
                to: EvaluationStage::Done.to_string(),
            });
        };
        let n_labeled = self.ranking.iter().filter(|r| r.label.is_known()).count();
        let truncated_drugs = self.ranking.iter().filter(|r| r.truncated).count();
        let backend = if self.function.requires_backend() {
            self.harness.library.backend_name().map(|s| s.to_string())
        } else {
            None
        };
        Ok(EvaluationOutcome {
            context: self.context,
            function: self.function,
            polarity: self.function.polarity(),
            ranking: self.ranking,
            observed_auc,
            baseline,
            n_labeled,
            truncated_drugs,
            backend,
        })
    }
}
