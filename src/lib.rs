//! Drug repositioning by signature matching.
//!
//! Perturbation profiles of drugs are scored against disease (and disease
//! subtype) differential expression profiles with a fixed set of scoring
//! functions. Each (disease context, scoring function) ranking is then judged
//! by how well it separates indicated from contraindicated drugs, against a
//! label permutation null.
//!
//! ```text
//! SignatureStore + StratificationManager
//!     -> ScoringFunctionLibrary (-> GseBackend)
//!     -> EvaluationHarness -> ResultsAggregator
//! ```

// import own modules
pub mod aggregate;
mod algorithm;
pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod gsva;
pub mod harness;
pub mod io;
pub mod labels;
pub mod profile;
pub mod scoring;
mod stats;
pub mod strata;
mod utils;

// export module fn, struct, trait ...
pub use aggregate::{BatchReport, DuplicateResultWarning, ResultRecord, ResultsAggregator, UnitFailure};
pub use backend::{
    CallGuard, CancelToken, EnrichmentRequest, EnrichmentResult, ExternalBackend, GeneSet,
    GseBackend, LimitedBackend, PrerankBackend, RankedList,
};
pub use batch::{BatchRunner, BatchSummary, WorkUnit};
pub use config::RunConfig;
pub use error::{ErrorKind, Result, ScoringError};
pub use gsva::{combine_pathway_scores, GeneSetCollection, Gsva, PathwayScore};
pub use harness::{
    rank_auc, ContextEvaluation, EvaluationHarness, EvaluationOutcome, EvaluationStage,
    HarnessConfig, PermutationBaseline, RankedDrug,
};
pub use labels::{Label, LabelSet};
pub use profile::{DiseaseContext, GeneId, Profile, ProfileKind, SignatureStore, Subtype};
pub use scoring::{
    Family, Polarity, ScoringFunction, ScoringFunctionLibrary, ScoringFunctionResult, ScoringParams,
};
pub use stats::{adjust_bh, fisher_combine};
pub use strata::{SchemeSpec, StratificationManager};
