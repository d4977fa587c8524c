//! Gene set enrichment backends.
//!
//! The scoring library only sees the [`GseBackend`] trait. Two real
//! implementations exist: [`PrerankBackend`] runs the weighted running-sum
//! test in-process on a dedicated rayon pool, [`ExternalBackend`] hands the
//! ranked list and gene sets to an external program (e.g. a GPU GSEA build).
//! [`LimitedBackend`] caps how many calls run at once and applies the wall
//! clock budget.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::algorithm::{EnrichmentScore, EnrichmentScoreTrait};
use crate::error::{Result, ScoringError};
use crate::profile::{GeneId, Profile};
use crate::stats::EnrichmentSummary;
use crate::utils::{DynamicEnum, FileReader};

/// Run-level cancellation flag shared by every worker and backend call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation checked cooperatively inside a backend call.
#[derive(Debug, Clone, Default)]
pub struct CallGuard {
    deadline: Option<Instant>,
    budget: Option<Duration>,
    cancel: CancelToken,
}

impl CallGuard {
    pub fn new(budget: Option<Duration>, cancel: CancelToken) -> Self {
        CallGuard {
            deadline: budget.map(|b| Instant::now() + b),
            budget,
            cancel,
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn check(&self, backend: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ScoringError::Cancelled);
        }
        if self.is_expired() {
            return Err(self.timeout_error(backend));
        }
        Ok(())
    }

    fn timeout_error(&self, backend: &str) -> ScoringError {
        ScoringError::ComputationTimeout {
            backend: backend.to_string(),
            budget_secs: self.budget.map_or(0.0, |b| b.as_secs_f64()),
        }
    }
}

/// Genes in descending order of their ranking value.
#[derive(Debug, Clone)]
pub struct RankedList {
    genes: DynamicEnum<GeneId>,
    values: Vec<f64>,
}

impl RankedList {
    pub fn from_profile(profile: &Profile) -> Self {
        let ranked = profile.ranked();
        let genes: Vec<GeneId> = ranked.iter().map(|(g, _)| (*g).clone()).collect();
        let values: Vec<f64> = ranked.iter().map(|(_, v)| *v).collect();
        RankedList {
            // profile genes are already unique
            genes: DynamicEnum::try_from_slice(&genes).unwrap_or_default(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn genes(&self) -> &[GeneId] {
        self.genes.get_vec()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// sorted positions of the given genes, genes not in the list are dropped
    pub fn hit_index(&self, genes: &[GeneId]) -> Vec<usize> {
        let mut hits: Vec<usize> = self.genes.index_of_any(genes).into_iter().copied().collect();
        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneSet {
    pub name: String,
    pub genes: Vec<GeneId>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub ranked: RankedList,
    pub gene_sets: Vec<GeneSet>,
    pub permutations: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub term: String,
    pub statistic: f64,
    pub nes: Option<f64>,
    pub p_value: f64,
    pub n_hits: Option<usize>,
}

/// A pure function of its request: same request and seed, same results.
pub trait GseBackend: Send + Sync {
    fn name(&self) -> &str;
    /// One result per requested gene set, in request order.
    fn enrich(&self, request: &EnrichmentRequest, guard: &CallGuard)
        -> Result<Vec<EnrichmentResult>>;
}

/// In-process preranked GSEA.
pub struct PrerankBackend {
    weight: f64,
    chunk: usize,
    pool: rayon::ThreadPool,
}

impl PrerankBackend {
    pub fn new(weight: f64, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("prerank-{i}"))
            .build()
            .map_err(|e| ScoringError::BackendUnavailable {
                backend: "prerank".to_string(),
                reason: e.to_string(),
            })?;
        Ok(PrerankBackend {
            weight,
            chunk: 64,
            pool,
        })
    }

    /// permutations drawn between two guard checks
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

impl GseBackend for PrerankBackend {
    fn name(&self) -> &str {
        "prerank"
    }

    fn enrich(
        &self,
        request: &EnrichmentRequest,
        guard: &CallGuard,
    ) -> Result<Vec<EnrichmentResult>> {
        guard.check(self.name())?;
        let ranked = &request.ranked;
        let weighted_metric: Vec<f64> = ranked
            .values()
            .iter()
            .map(|x| x.abs().powf(self.weight))
            .collect();
        let hit_sets: Vec<Vec<usize>> = request
            .gene_sets
            .iter()
            .map(|gs| ranked.hit_index(&gs.genes))
            .collect();

        let mut es = EnrichmentScore::new(ranked.len(), request.permutations, request.seed);
        let observed: Vec<f64> = hit_sets
            .iter()
            .map(|hits| es.fast_random_walk(&weighted_metric, hits))
            .collect();

        let mut esnull: Vec<Vec<f64>> = vec![Vec::with_capacity(es.nperm()); hit_sets.len()];
        let mut done = 0;
        while done < es.nperm() {
            guard.check(self.name())?;
            let count = self.chunk.min(es.nperm() - done);
            let gperm = es.gene_permutation(count);
            let chunk_es = self
                .pool
                .install(|| es.enrichment_score_gene(&weighted_metric, &hit_sets, &gperm));
            for row in chunk_es {
                row.into_iter()
                    .enumerate()
                    .for_each(|(s, v)| esnull[s].push(v));
            }
            done += count;
        }

        let results = request
            .gene_sets
            .iter()
            .zip(hit_sets)
            .zip(observed)
            .zip(esnull)
            .map(|(((gs, hits), e), null)| {
                let n_hits = hits.len();
                let summary = EnrichmentSummary::new(&gs.name, e, hits, null);
                EnrichmentResult {
                    term: summary.term,
                    statistic: summary.es,
                    nes: Some(summary.nes),
                    p_value: summary.pval,
                    n_hits: Some(n_hits),
                }
            })
            .collect();
        Ok(results)
    }
}

/// Runs an external enrichment program. The program is called as
/// `<program> <args..> --rnk <file> --gmt <file> --nperm <n> --seed <s>` and
/// must print one `term<TAB>statistic<TAB>p_value` line per gene set.
#[derive(Debug, Clone)]
pub struct ExternalBackend {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    scratch: PathBuf,
    poll: Duration,
}

impl ExternalBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "external".to_string());
        ExternalBackend {
            name,
            program,
            args,
            scratch: std::env::temp_dir(),
            poll: Duration::from_millis(20),
        }
    }

    pub fn with_scratch(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = dir.into();
        self
    }

    fn unavailable(&self, reason: impl Into<String>) -> ScoringError {
        ScoringError::BackendUnavailable {
            backend: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> ScoringError {
        ScoringError::BackendFailed {
            backend: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn write_inputs(&self, dir: &Path, request: &EnrichmentRequest) -> Result<(PathBuf, PathBuf)> {
        let rnk = dir.join("ranked.rnk");
        let mut w = BufWriter::new(File::create(&rnk)?);
        for (g, v) in request.ranked.genes().iter().zip(request.ranked.values()) {
            writeln!(w, "{g}\t{v}")?;
        }
        w.flush()?;

        let gmt = dir.join("query.gmt");
        let mut w = BufWriter::new(File::create(&gmt)?);
        for gs in request.gene_sets.iter() {
            writeln!(w, "{}\tNA\t{}", gs.name, gs.genes.join("\t"))?;
        }
        w.flush()?;
        Ok((rnk, gmt))
    }

    fn run_in(
        &self,
        dir: &Path,
        request: &EnrichmentRequest,
        guard: &CallGuard,
    ) -> Result<Vec<EnrichmentResult>> {
        let (rnk, gmt) = self.write_inputs(dir, request)?;
        let out_path = dir.join("result.tsv");
        let stdout = File::create(&out_path)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--rnk")
            .arg(&rnk)
            .arg("--gmt")
            .arg(&gmt)
            .arg("--nperm")
            .arg(request.permutations.to_string())
            .arg("--seed")
            .arg(request.seed.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    self.unavailable(format!("cannot start {}: {e}", self.program.display()))
                }
                _ => ScoringError::Io(e),
            })?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Err(err) = guard.check(&self.name) {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(backend = %self.name, error = %err, "external enrichment stopped");
                return Err(err);
            }
            std::thread::sleep(self.poll);
        };
        if !status.success() {
            return Err(self.failed(format!("exited with {status}")));
        }
        self.parse_output(&out_path, request)
    }

    fn parse_output(&self, path: &Path, request: &EnrichmentRequest) -> Result<Vec<EnrichmentResult>> {
        let mut reader = FileReader::new();
        let path_str = path.to_string_lossy();
        reader
            .read_table(&path_str, '\t', false)
            .map_err(|e| self.failed(format!("unreadable output: {e}")))?;
        let mut parsed: Vec<EnrichmentResult> = Vec::with_capacity(reader.record.len());
        for r in reader.record.iter() {
            if r.len() < 3 {
                return Err(self.failed(format!("expected 3 columns, got {}", r.len())));
            }
            let statistic: f64 = r[1]
                .trim()
                .parse()
                .map_err(|_| self.failed(format!("bad statistic '{}'", r[1])))?;
            let p_value: f64 = r[2]
                .trim()
                .parse()
                .map_err(|_| self.failed(format!("bad p-value '{}'", r[2])))?;
            if !statistic.is_finite() || !(0.0..=1.0).contains(&p_value) {
                return Err(self.failed(format!("invalid values for term '{}'", r[0])));
            }
            parsed.push(EnrichmentResult {
                term: r[0].trim().to_string(),
                statistic,
                nes: None,
                p_value,
                n_hits: None,
            });
        }
        request
            .gene_sets
            .iter()
            .map(|gs| {
                parsed
                    .iter()
                    .find(|p| p.term == gs.name)
                    .cloned()
                    .ok_or_else(|| self.failed(format!("no result for gene set '{}'", gs.name)))
            })
            .collect()
    }
}

impl GseBackend for ExternalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn enrich(
        &self,
        request: &EnrichmentRequest,
        guard: &CallGuard,
    ) -> Result<Vec<EnrichmentResult>> {
        guard.check(&self.name)?;
        // removed on drop, also when the run fails
        let dir = tempfile::Builder::new()
            .prefix("sigscore-")
            .tempdir_in(&self.scratch)?;
        self.run_in(dir.path(), request, guard)
    }
}

/// Caps concurrent calls into the wrapped backend and applies a wall clock
/// budget per call. The budget starts once a permit is held. Timeouts are
/// returned to the caller, never retried here.
pub struct LimitedBackend {
    inner: Arc<dyn GseBackend>,
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
    timeout: Option<Duration>,
    wait_poll: Duration,
}

struct Permit<'a> {
    tx: &'a Sender<()>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(());
    }
}

impl LimitedBackend {
    pub fn new(inner: Arc<dyn GseBackend>, max_concurrent: usize, timeout: Option<Duration>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (permits_tx, permits_rx) = bounded(max_concurrent);
        for _ in 0..max_concurrent {
            let _ = permits_tx.send(());
        }
        LimitedBackend {
            inner,
            permits_tx,
            permits_rx,
            timeout,
            wait_poll: Duration::from_millis(25),
        }
    }

    fn acquire(&self, cancel: &CancelToken) -> Result<Permit<'_>> {
        loop {
            if cancel.is_cancelled() {
                return Err(ScoringError::Cancelled);
            }
            match self.permits_rx.recv_timeout(self.wait_poll) {
                Ok(()) => return Ok(Permit { tx: &self.permits_tx }),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ScoringError::BackendUnavailable {
                        backend: self.inner.name().to_string(),
                        reason: "permit pool closed".to_string(),
                    })
                }
            }
        }
    }
}

impl GseBackend for LimitedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enrich(
        &self,
        request: &EnrichmentRequest,
        guard: &CallGuard,
    ) -> Result<Vec<EnrichmentResult>> {
        let _permit = self.acquire(guard.cancel_token())?;
        let call_guard = CallGuard::new(self.timeout, guard.cancel_token().clone());
        call_guard.check(self.name())?;
        let started = Instant::now();
        let result = self.inner.enrich(request, &call_guard);
        tracing::debug!(
            backend = self.name(),
            sets = request.gene_sets.len(),
            permutations = request.permutations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "enrichment call"
        );
        result
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Deterministic stand-in: the statistic is the mean centred position of
    /// the set's hits (positive near the top), the p-value shrinks with |stat|.
    /// Tracks the peak number of concurrent calls.
    #[derive(Default)]
    pub struct StubBackend {
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub delay: Option<Duration>,
    }

    impl GseBackend for StubBackend {
        fn name(&self) -> &str {
            "stub"
        }

        fn enrich(
            &self,
            request: &EnrichmentRequest,
            guard: &CallGuard,
        ) -> Result<Vec<EnrichmentResult>> {
            guard.check(self.name())?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(d) = self.delay {
                std::thread::sleep(d);
            }
            let n = request.ranked.len() as f64;
            let out = request
                .gene_sets
                .iter()
                .map(|gs| {
                    let hits = request.ranked.hit_index(&gs.genes);
                    let stat = if hits.is_empty() || n < 2.0 {
                        0.0
                    } else {
                        let mean_pos =
                            hits.iter().map(|&h| h as f64).sum::<f64>() / hits.len() as f64;
                        1.0 - 2.0 * mean_pos / (n - 1.0)
                    };
                    EnrichmentResult {
                        term: gs.name.clone(),
                        statistic: stat,
                        nes: None,
                        p_value: (1.0 - stat.abs() * 0.9).clamp(0.01, 1.0),
                        n_hits: Some(hits.len()),
                    }
                })
                .collect();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(out)
        }
    }
}
