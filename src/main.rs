use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use sigscore::{
    io, BatchRunner, CancelToken, EvaluationHarness, ExternalBackend, GseBackend, HarnessConfig,
    LimitedBackend, PrerankBackend, ResultsAggregator, RunConfig, ScoringFunction,
    ScoringFunctionLibrary, StratificationManager,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Score drug perturbation profiles against disease profiles and evaluate
/// the rankings with known indications.
#[derive(Parser, Debug)]
#[command(version, about = "Drug repositioning by signature matching", long_about = None)]
struct Args {
    /// Perturbation profiles: drug, gene, statistic
    #[arg(short, long)]
    perturbations: String,
    /// Disease profiles: cohort[/scheme:subtype], gene, statistic, [significance]
    #[arg(short, long)]
    diseases: String,
    /// Stratifications: scheme, cohort, subtype, sample
    #[arg(short, long)]
    strata: Option<String>,
    /// Drug labels: cohort, drug, label, [scheme, subtype]
    #[arg(short, long)]
    labels: String,
    /// Output prefix
    #[arg(short, long)]
    output: PathBuf,
    /// JSON run configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 'k', long)]
    top_k: Option<usize>,
    #[arg(long)]
    min_shared_genes: Option<usize>,
    #[arg(long)]
    significance_cutoff: Option<f64>,
    /// Comma separated scoring functions
    #[arg(short, long, value_delimiter = ',')]
    functions: Vec<ScoringFunction>,
    #[arg(long)]
    gse_permutations: Option<usize>,
    #[arg(long)]
    baseline_permutations: Option<usize>,
    /// Seed of both the enrichment and the label permutations
    #[arg(long)]
    seed: Option<u64>,
    #[arg(short = 't', long)]
    concurrency: Option<usize>,
    #[arg(long)]
    backend_concurrency: Option<usize>,
    #[arg(long)]
    backend_threads: Option<usize>,
    /// Wall clock budget of one enrichment call, seconds
    #[arg(long)]
    backend_timeout: Option<f64>,
    /// External enrichment program used instead of the built-in prerank test
    #[arg(long)]
    external_backend: Option<PathBuf>,
    /// Extra argument for the external program, repeatable
    #[arg(long, allow_hyphen_values = true)]
    external_arg: Vec<String>,
    /// GMT gene set collection, required by gsva
    #[arg(short, long)]
    gene_sets: Option<PathBuf>,
    #[arg(long)]
    gsva_permutations: Option<usize>,
    #[arg(long)]
    gsva_q_cutoff: Option<f64>,
    /// Also write the full drug rankings
    #[arg(long)]
    rankings: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig, Box<dyn Error>> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.top_k {
            cfg.top_k = v;
        }
        if let Some(v) = self.min_shared_genes {
            cfg.min_shared_genes = v;
        }
        if self.significance_cutoff.is_some() {
            cfg.significance_cutoff = self.significance_cutoff;
        }
        if !self.functions.is_empty() {
            cfg.functions = self.functions.clone();
        }
        if let Some(v) = self.gse_permutations {
            cfg.gse_permutations = v;
        }
        if let Some(v) = self.baseline_permutations {
            cfg.baseline_permutations = v;
        }
        if let Some(v) = self.seed {
            cfg.gse_seed = v;
            cfg.baseline_seed = v;
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = v;
        }
        if let Some(v) = self.backend_concurrency {
            cfg.backend_concurrency = v;
        }
        if let Some(v) = self.backend_threads {
            cfg.backend_threads = v;
        }
        if self.backend_timeout.is_some() {
            cfg.backend_timeout_secs = self.backend_timeout;
        }
        if self.gene_sets.is_some() {
            cfg.gene_sets = self.gene_sets.clone();
        }
        if let Some(v) = self.gsva_permutations {
            cfg.gsva_permutations = v;
        }
        if let Some(v) = self.gsva_q_cutoff {
            cfg.gsva_q_cutoff = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn backend(&self, cfg: &RunConfig) -> Result<Option<Arc<dyn GseBackend>>, Box<dyn Error>> {
        if !cfg.needs_backend() {
            return Ok(None);
        }
        let inner: Arc<dyn GseBackend> = match &self.external_backend {
            Some(program) => Arc::new(ExternalBackend::new(program, self.external_arg.clone())),
            None => Arc::new(PrerankBackend::new(cfg.gse_weight, cfg.backend_threads)?),
        };
        info!(backend = inner.name(), "gene set enrichment backend");
        Ok(Some(Arc::new(LimitedBackend::new(
            inner,
            cfg.backend_concurrency,
            cfg.backend_timeout(),
        ))))
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = args.run_config()?;
    let start = Instant::now();

    // read data
    let store = Arc::new(io::read_store(&args.perturbations, &args.diseases)?);
    let schemes = match &args.strata {
        Some(path) => io::read_strata(path)?,
        None => Vec::new(),
    };
    let strata = Arc::new(StratificationManager::build(schemes, store.clone())?);
    let labels = Arc::new(io::read_labels(&args.labels)?);

    let mut library = ScoringFunctionLibrary::new(cfg.scoring_params(), args.backend(&cfg)?)
        .with_functions(&cfg.functions);
    if let Some(path) = &cfg.gene_sets {
        let gmt = io::read_gmt(&path.to_string_lossy())?;
        library = library.with_gene_sets(Arc::new(gmt))?;
    }
    let harness = EvaluationHarness::new(
        store,
        strata,
        labels,
        Arc::new(library),
        HarnessConfig {
            baseline_permutations: cfg.baseline_permutations,
            baseline_seed: cfg.baseline_seed,
        },
    );

    let aggregator = ResultsAggregator::new();
    let runner = BatchRunner::new(Arc::new(harness), cfg.concurrency).keep_rankings(args.rankings);
    let summary = runner.run(&aggregator, &CancelToken::new());

    let report = aggregator.report(true);
    report.write_all(&args.output)?;
    if args.rankings {
        let mut path = args.output.clone().into_os_string();
        path.push(".rankings.tsv");
        io::write_rankings_tsv(&summary.outcomes, BufWriter::new(File::create(path)?))?;
    }
    info!(
        records = report.records.len(),
        failures = report.failures.len(),
        "Finished in {:.2?}",
        start.elapsed()
    );
    Ok(())
}
