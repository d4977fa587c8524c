//! Collects one record per (disease context, scoring function) unit, plus the
//! units that failed, and writes them out.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, ScoringError};
use crate::harness::EvaluationOutcome;
use crate::profile::DiseaseContext;
use crate::scoring::{Polarity, ScoringFunction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub context: DiseaseContext,
    pub function: ScoringFunction,
    pub polarity: Polarity,
    pub observed_auc: f64,
    pub p_value: f64,
    pub permutations: usize,
    pub n_drugs: usize,
    pub n_labeled: usize,
    /// drugs whose score came from a shrunken top/bottom window
    pub truncated_drugs: usize,
    pub backend: Option<String>,
}

impl From<&EvaluationOutcome> for ResultRecord {
    fn from(o: &EvaluationOutcome) -> Self {
        ResultRecord {
            context: o.context.clone(),
            function: o.function,
            polarity: o.polarity,
            observed_auc: o.observed_auc,
            p_value: o.baseline.p_value,
            permutations: o.baseline.permutations,
            n_drugs: o.ranking.len(),
            n_labeled: o.n_labeled,
            truncated_drugs: o.truncated_drugs,
            backend: o.backend.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub context: DiseaseContext,
    pub function: ScoringFunction,
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitFailure {
    pub fn new(context: DiseaseContext, function: ScoringFunction, err: &ScoringError) -> Self {
        UnitFailure {
            context,
            function,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A (context, function) pair submitted more than once. Both records are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateResultWarning {
    pub context: DiseaseContext,
    pub function: ScoringFunction,
}

#[derive(Debug, Default)]
struct Collected {
    records: Vec<ResultRecord>,
    failures: Vec<UnitFailure>,
    seen: HashSet<(DiseaseContext, ScoringFunction)>,
    duplicates: Vec<DuplicateResultWarning>,
}

/// Append-only, one writer at a time.
#[derive(Debug, Default)]
pub struct ResultsAggregator {
    inner: Mutex<Collected>,
}

impl ResultsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        // records are pushed whole, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_result(&self, record: ResultRecord) -> Option<DuplicateResultWarning> {
        let mut c = self.lock();
        let key = (record.context.clone(), record.function);
        let warning = if c.seen.insert(key) {
            None
        } else {
            tracing::warn!(
                context = %record.context,
                function = %record.function,
                "duplicate result submitted"
            );
            let w = DuplicateResultWarning {
                context: record.context.clone(),
                function: record.function,
            };
            c.duplicates.push(w.clone());
            Some(w)
        };
        c.records.push(record);
        warning
    }

    pub fn add_failure(&self, failure: UnitFailure) {
        tracing::warn!(
            context = %failure.context,
            function = %failure.function,
            kind = ?failure.kind,
            error = %failure.message,
            "unit failed"
        );
        self.lock().failures.push(failure);
    }

    /// Records in submission order.
    pub fn export(&self) -> Vec<ResultRecord> {
        self.lock().records.clone()
    }

    /// Records ordered by (context, function); stable for duplicates.
    pub fn export_sorted(&self) -> Vec<ResultRecord> {
        let mut records = self.export();
        records.sort_by(|a, b| (&a.context, a.function).cmp(&(&b.context, b.function)));
        records
    }

    pub fn failures(&self) -> Vec<UnitFailure> {
        self.lock().failures.clone()
    }

    pub fn duplicates(&self) -> Vec<DuplicateResultWarning> {
        self.lock().duplicates.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn report(&self, sorted: bool) -> BatchReport {
        let records = if sorted {
            self.export_sorted()
        } else {
            self.export()
        };
        let mut failures = self.failures();
        if sorted {
            failures.sort_by(|a, b| (&a.context, a.function).cmp(&(&b.context, b.function)));
        }
        BatchReport { records, failures }
    }
}

/// Partial results of a batch next to the units that failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub records: Vec<ResultRecord>,
    pub failures: Vec<UnitFailure>,
}

#[derive(Serialize)]
struct RecordRow<'a> {
    context: String,
    cohort: &'a str,
    scheme: &'a str,
    subtype: &'a str,
    function: &'static str,
    polarity: Polarity,
    observed_auc: f64,
    p_value: f64,
    permutations: usize,
    n_drugs: usize,
    n_labeled: usize,
    truncated_drugs: usize,
    backend: &'a str,
}

#[derive(Serialize)]
struct FailureRow<'a> {
    context: String,
    function: &'static str,
    kind: ErrorKind,
    message: &'a str,
}

impl BatchReport {
    pub fn write_records_tsv<W: Write>(&self, w: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(w);
        for r in self.records.iter() {
            let sub = r.context.subtype.as_ref();
            wtr.serialize(RecordRow {
                context: r.context.to_string(),
                cohort: &r.context.cohort,
                scheme: sub.map_or("", |s| s.scheme.as_str()),
                subtype: sub.map_or("", |s| s.label.as_str()),
                function: r.function.name(),
                polarity: r.polarity,
                observed_auc: r.observed_auc,
                p_value: r.p_value,
                permutations: r.permutations,
                n_drugs: r.n_drugs,
                n_labeled: r.n_labeled,
                truncated_drugs: r.truncated_drugs,
                backend: r.backend.as_deref().unwrap_or(""),
            })
            .map_err(csv_error)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_failures_tsv<W: Write>(&self, w: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(w);
        for f in self.failures.iter() {
            wtr.serialize(FailureRow {
                context: f.context.to_string(),
                function: f.function.name(),
                kind: f.kind,
                message: &f.message,
            })
            .map_err(csv_error)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_json<W: Write>(&self, w: W) -> Result<()> {
        serde_json::to_writer_pretty(w, self)
            .map_err(|e| ScoringError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// `<prefix>.records.tsv`, `<prefix>.failures.tsv` and `<prefix>.json`
    pub fn write_all(&self, prefix: &Path) -> Result<()> {
        let with_ext = |ext: &str| {
            let mut p = prefix.as_os_str().to_os_string();
            p.push(ext);
            std::path::PathBuf::from(p)
        };
        self.write_records_tsv(BufWriter::new(File::create(with_ext(".records.tsv"))?))?;
        self.write_failures_tsv(BufWriter::new(File::create(with_ext(".failures.tsv"))?))?;
        let mut json = BufWriter::new(File::create(with_ext(".json"))?);
        self.write_json(&mut json)?;
        json.flush()?;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> ScoringError {
    ScoringError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ctx: DiseaseContext, function: ScoringFunction, auc: f64) -> ResultRecord {
        ResultRecord {
            context: ctx,
            function,
            polarity: function.polarity(),
            observed_auc: auc,
            p_value: 0.5,
            permutations: 10,
            n_drugs: 4,
            n_labeled: 2,
            truncated_drugs: 0,
            backend: None,
        }
    }

    #[test]
    fn test_sorted_export_by_context() {
        let agg = ResultsAggregator::new();
        let c1 = DiseaseContext::subtype("BRCA", "pam50", "Basal");
        let c2 = DiseaseContext::subtype("BRCA", "pam50", "LumA");
        agg.add_result(record(c2.clone(), ScoringFunction::XSum, 0.7));
        agg.add_result(record(c1.clone(), ScoringFunction::XSum, 0.6));

        let insertion = agg.export();
        assert_eq!(insertion[0].context, c2);
        let sorted = agg.export_sorted();
        assert_eq!(sorted[0].context, c1);
        assert_eq!(sorted[1].context, c2);
    }

    #[test]
    fn test_duplicate_flagged_not_rejected() {
        let agg = ResultsAggregator::new();
        let c = DiseaseContext::whole("OV");
        assert!(agg.add_result(record(c.clone(), ScoringFunction::XCos, 0.4)).is_none());
        let w = agg.add_result(record(c.clone(), ScoringFunction::XCos, 0.9));
        assert_eq!(
            w,
            Some(DuplicateResultWarning {
                context: c.clone(),
                function: ScoringFunction::XCos
            })
        );
        assert!(agg.add_result(record(c, ScoringFunction::Pearson, 0.4)).is_none());
        assert_eq!(agg.len(), 3);
        assert_eq!(agg.duplicates().len(), 1);
    }

    #[test]
    fn test_report_writers() {
        let agg = ResultsAggregator::new();
        let ctx = DiseaseContext::subtype("BRCA", "pam50", "LumA");
        agg.add_result(record(ctx.clone(), ScoringFunction::Spearman, 0.75));
        agg.add_failure(UnitFailure::new(
            DiseaseContext::whole("BRCA"),
            ScoringFunction::GseaReversal,
            &ScoringError::BackendUnavailable {
                backend: "cudagsea".to_string(),
                reason: "not installed".to_string(),
            },
        ));
        let report = agg.report(true);

        let mut tsv = Vec::new();
        report.write_records_tsv(&mut tsv).unwrap();
        let text = String::from_utf8(tsv).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("context\tcohort\tscheme\tsubtype\tfunction"));
        assert!(lines[1].starts_with("BRCA/pam50:LumA\tBRCA\tpam50\tLumA\tspearman\tlower_is_stronger"));

        let mut ftsv = Vec::new();
        report.write_failures_tsv(&mut ftsv).unwrap();
        assert!(String::from_utf8(ftsv).unwrap().contains("gsea_reversal\tbackend\t"));

        let mut json = Vec::new();
        report.write_json(&mut json).unwrap();
        let back: BatchReport = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, report);
    }
}
