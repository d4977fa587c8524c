//! Runs the (context x function) cross product on a fixed number of worker
//! threads and funnels every outcome into one aggregator.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};

use crate::aggregate::{ResultRecord, ResultsAggregator, UnitFailure};
use crate::backend::CancelToken;
use crate::error::{Result, ScoringError};
use crate::harness::{EvaluationHarness, EvaluationOutcome};
use crate::profile::DiseaseContext;
use crate::scoring::ScoringFunction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub context: DiseaseContext,
    pub function: ScoringFunction,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub units: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// full rankings, only kept when the runner was asked to
    pub outcomes: Vec<EvaluationOutcome>,
}

pub struct BatchRunner {
    harness: Arc<EvaluationHarness>,
    concurrency: usize,
    keep_rankings: bool,
}

impl BatchRunner {
    pub fn new(harness: Arc<EvaluationHarness>, concurrency: usize) -> Self {
        BatchRunner {
            harness,
            concurrency: concurrency.max(1),
            keep_rankings: false,
        }
    }

    pub fn keep_rankings(mut self, keep: bool) -> Self {
        self.keep_rankings = keep;
        self
    }

    /// Every known context crossed with every registered function, context major.
    pub fn units(&self) -> Vec<WorkUnit> {
        let functions = self.harness.library().functions();
        self.harness
            .strata()
            .list_all_contexts()
            .into_iter()
            .flat_map(|context| {
                functions.iter().map(move |&function| WorkUnit {
                    context: context.clone(),
                    function,
                })
            })
            .collect()
    }

    pub fn run(&self, aggregator: &ResultsAggregator, cancel: &CancelToken) -> BatchSummary {
        self.run_units(self.units(), aggregator, cancel)
    }

    /// Unit failures are recorded in `aggregator`, never propagated. Once
    /// `cancel` fires, units not yet started are recorded as cancelled.
    pub fn run_units(
        &self,
        units: Vec<WorkUnit>,
        aggregator: &ResultsAggregator,
        cancel: &CancelToken,
    ) -> BatchSummary {
        let started = Instant::now();
        let mut summary = BatchSummary {
            units: units.len(),
            ..Default::default()
        };
        let workers = self.concurrency.min(units.len()).max(1);
        tracing::info!(units = units.len(), workers, "batch started");

        let (work_tx, work_rx) = unbounded::<WorkUnit>();
        for u in units {
            // receiver is alive until the scope below ends
            let _ = work_tx.send(u);
        }
        drop(work_tx);
        let (done_tx, done_rx) = unbounded::<(WorkUnit, Result<EvaluationOutcome>)>();

        std::thread::scope(|s| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let harness = &self.harness;
                s.spawn(move || {
                    for unit in work_rx.iter() {
                        let res = if cancel.is_cancelled() {
                            Err(ScoringError::Cancelled)
                        } else {
                            harness.evaluate(unit.function, &unit.context, cancel)
                        };
                        if done_tx.send((unit, res)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            // single writer
            for (unit, res) in done_rx.iter() {
                match res {
                    Ok(outcome) => {
                        tracing::debug!(
                            context = %unit.context,
                            function = %unit.function,
                            auc = outcome.observed_auc,
                            p_value = outcome.baseline.p_value,
                            "unit done"
                        );
                        aggregator.add_result(ResultRecord::from(&outcome));
                        summary.succeeded += 1;
                        if self.keep_rankings {
                            summary.outcomes.push(outcome);
                        }
                    }
                    Err(err) => {
                        if matches!(err, ScoringError::Cancelled) {
                            summary.cancelled += 1;
                        } else {
                            summary.failed += 1;
                        }
                        aggregator.add_failure(UnitFailure::new(unit.context, unit.function, &err));
                    }
                }
            }
        });

        summary
            .outcomes
            .sort_by(|a, b| (&a.context, a.function).cmp(&(&b.context, b.function)));
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::backend::GseBackend;
    use crate::error::ErrorKind;
    use crate::harness::fixtures;
    use crate::harness::HarnessConfig;
    use crate::labels::Label;
    use crate::scoring::{ScoringFunctionLibrary, ScoringParams};

    #[test]
    fn test_concurrency_does_not_change_results() {
        let run = |concurrency: usize| {
            let harness = Arc::new(fixtures::harness(fixtures::labels(), 50, 9));
            let agg = ResultsAggregator::new();
            let summary = BatchRunner::new(harness, concurrency).run(&agg, &CancelToken::new());
            assert_eq!(summary.units, 18);
            assert_eq!(summary.succeeded, 18);
            agg.export_sorted()
        };
        let one = run(1);
        let eight = run(8);
        assert_eq!(one.len(), 18);
        assert_eq!(one, eight);
    }

    #[test]
    fn test_partial_failures_are_isolated() {
        let store = fixtures::store();
        let strata = fixtures::strata(&store);
        let mut labels = fixtures::labels();
        let basal = DiseaseContext::subtype("BRCA", "pam50", "Basal");
        for d in ["d00", "d01", "d03", "d05", "d08"] {
            labels.insert_override(basal.clone(), d, Label::Unknown);
        }
        // no enrichment backend: both gsea functions fail everywhere
        let library = ScoringFunctionLibrary::new(
            ScoringParams {
                top_k: 2,
                min_shared_genes: 3,
                ..Default::default()
            },
            None,
        );
        let harness = EvaluationHarness::new(
            store,
            strata,
            Arc::new(labels),
            Arc::new(library),
            HarnessConfig {
                baseline_permutations: 20,
                baseline_seed: 1,
            },
        );
        let agg = ResultsAggregator::new();
        let summary = BatchRunner::new(Arc::new(harness), 4).run(&agg, &CancelToken::new());

        assert_eq!(summary.succeeded, 8);
        assert_eq!(summary.failed, 10);
        let failures = agg.failures();
        let backend = failures.iter().filter(|f| f.kind == ErrorKind::Backend).count();
        let statistical = failures
            .iter()
            .filter(|f| f.kind == ErrorKind::Statistical)
            .count();
        assert_eq!((backend, statistical), (6, 4));
        assert!(failures
            .iter()
            .filter(|f| f.kind == ErrorKind::Statistical)
            .all(|f| f.context == basal));
        assert!(agg.export().iter().all(|r| r.context != basal));
    }

    #[test]
    fn test_cancelled_batch_records_every_unit() {
        let harness = Arc::new(fixtures::harness(fixtures::labels(), 10, 1));
        let cancel = CancelToken::new();
        cancel.cancel();
        let agg = ResultsAggregator::new();
        let summary = BatchRunner::new(harness, 3).run(&agg, &cancel);
        assert_eq!(summary.cancelled, 18);
        assert!(agg.is_empty());
        assert!(agg.failures().iter().all(|f| f.kind == ErrorKind::Cancelled));
    }

    #[test]
    fn test_cancel_mid_batch_keeps_finished_results() {
        let store = fixtures::store();
        let strata = fixtures::strata(&store);
        let backend: Arc<dyn GseBackend> = Arc::new(StubBackend {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let library = ScoringFunctionLibrary::new(
            ScoringParams {
                top_k: 2,
                min_shared_genes: 3,
                gse_permutations: 10,
                ..Default::default()
            },
            Some(backend),
        );
        let harness = EvaluationHarness::new(
            store,
            strata,
            Arc::new(fixtures::labels()),
            Arc::new(library),
            HarnessConfig {
                baseline_permutations: 20,
                baseline_seed: 1,
            },
        );
        let brca = DiseaseContext::whole("BRCA");
        let luma = DiseaseContext::subtype("BRCA", "pam50", "LumA");
        // one fast unit, then slow backend units
        let units: Vec<WorkUnit> = [
            (brca.clone(), ScoringFunction::XSum),
            (brca, ScoringFunction::GseaConnectivity),
            (luma.clone(), ScoringFunction::GseaReversal),
            (luma, ScoringFunction::Pearson),
        ]
        .into_iter()
        .map(|(context, function)| WorkUnit { context, function })
        .collect();

        let agg = ResultsAggregator::new();
        let cancel = CancelToken::new();
        let runner = BatchRunner::new(Arc::new(harness), 1);
        let (summary, before) = std::thread::scope(|s| {
            let watcher = s.spawn(|| {
                let started = Instant::now();
                while agg.is_empty() && started.elapsed() < Duration::from_secs(10) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                let before = agg.export();
                cancel.cancel();
                before
            });
            let summary = runner.run_units(units, &agg, &cancel);
            (summary, watcher.join().unwrap())
        });

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].function, ScoringFunction::XSum);
        assert_eq!(before[0].n_drugs, 12);
        assert!(before[0].observed_auc.is_finite());
        assert_eq!(agg.export(), before);

        assert_eq!(summary.units, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.cancelled, 3);
        let failures = agg.failures();
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|f| f.kind == ErrorKind::Cancelled));
    }

    #[test]
    fn test_rankings_kept_on_request() {
        let harness = Arc::new(fixtures::harness(fixtures::labels(), 10, 1));
        let runner = BatchRunner::new(harness, 2).keep_rankings(true);
        let units = vec![WorkUnit {
            context: DiseaseContext::whole("BRCA"),
            function: ScoringFunction::XSum,
        }];
        let summary = runner.run_units(units, &ResultsAggregator::new(), &CancelToken::new());
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].ranking[0].drug, "d00");
    }
}
