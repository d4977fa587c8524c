//! Tab-separated inputs of the command line tool and the ranking output.
//!
//! * profiles: `id  gene  statistic  [significance]`, one gene per line, with a
//!   header line. Disease ids are `cohort` or `cohort/scheme:label`.
//! * stratifications: `scheme  cohort  subtype  sample`, with a header line.
//! * labels: `cohort  drug  label  [scheme  subtype]`, with a header line. The
//!   optional columns turn the line into a subtype override.
//! * gene sets: GMT, `name  description  gene..`, no header.
//!
//! Lines starting with `#` are ignored.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::backend::GeneSet;
use crate::error::{Result, ScoringError};
use crate::gsva::GeneSetCollection;
use crate::harness::EvaluationOutcome;
use crate::labels::{Label, LabelSet};
use crate::profile::{DiseaseContext, GeneId, Profile, ProfileKind, SignatureStore};
use crate::strata::SchemeSpec;
use crate::utils::FileReader;

fn read_tsv(path: &str, min_cols: usize) -> Result<Vec<Vec<String>>> {
    let mut reader = FileReader::new();
    reader
        .read_csv(path, b'\t', true, Some(b'#'))
        .map_err(|e| ScoringError::Config(format!("{path}: {e}")))?;
    let header = reader.header.get_vec();
    if header.len() < min_cols {
        return Err(ScoringError::Config(format!(
            "{path}: header '{}' has fewer than {min_cols} columns",
            header.join("\t")
        )));
    }
    for (i, r) in reader.record.iter().enumerate() {
        if r.len() < min_cols {
            return Err(ScoringError::Config(format!(
                "{path}: line {} has {} columns, expected at least {min_cols}",
                i + 2,
                r.len()
            )));
        }
    }
    tracing::debug!(path, lines = reader.lines_read(), "table read");
    Ok(reader.record)
}

#[derive(Default)]
struct ProfileColumns {
    genes: Vec<GeneId>,
    stats: Vec<f64>,
    sig: Vec<Option<f64>>,
}

/// Profiles of a long table, in order of first appearance of their id.
pub fn read_profiles(path: &str, kind: ProfileKind) -> Result<Vec<(String, Profile)>> {
    let rows = read_tsv(path, 3)?;
    let mut order: Vec<String> = Vec::new();
    let mut cols: BTreeMap<String, ProfileColumns> = BTreeMap::new();
    for r in rows.iter() {
        let id = r[0].as_str();
        let stat: f64 = r[2].parse().map_err(|_| {
            ScoringError::malformed(id, format!("{kind:?} statistic '{}' is not a number", r[2]))
        })?;
        let sig = match r.get(3).map(|s| s.as_str()) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<f64>().map_err(|_| {
                ScoringError::malformed(id, format!("significance '{s}' is not a number"))
            })?),
        };
        let entry = cols.entry(id.to_string()).or_insert_with(|| {
            order.push(id.to_string());
            ProfileColumns::default()
        });
        entry.genes.push(r[1].clone());
        entry.stats.push(stat);
        entry.sig.push(sig);
    }

    let mut profiles = Vec::with_capacity(order.len());
    for id in order {
        let Some(c) = cols.remove(&id) else { continue };
        let significance = if c.sig.iter().all(|s| s.is_none()) {
            None
        } else {
            let sig: Option<Vec<f64>> = c.sig.into_iter().collect();
            Some(sig.ok_or_else(|| {
                ScoringError::malformed(&id, "significance given for some genes only")
            })?)
        };
        let profile = Profile::new(&id, c.genes, c.stats, significance)?;
        profiles.push((id, profile));
    }
    tracing::info!(path, kind = ?kind, profiles = profiles.len(), "profiles read");
    Ok(profiles)
}

pub fn read_store(perturbations: &str, diseases: &str) -> Result<SignatureStore> {
    let mut builder = SignatureStore::builder();
    for (drug, p) in read_profiles(perturbations, ProfileKind::Perturbation)? {
        builder = builder.perturbation(&drug, p)?;
    }
    for (id, p) in read_profiles(diseases, ProfileKind::Disease)? {
        let ctx = DiseaseContext::parse(&id).ok_or_else(|| {
            ScoringError::malformed(&id, "disease id must be 'cohort' or 'cohort/scheme:label'")
        })?;
        builder = builder.disease(ctx, p)?;
    }
    Ok(builder.build())
}

/// One spec per (scheme, cohort) pair.
pub fn read_strata(path: &str) -> Result<Vec<SchemeSpec>> {
    let mut specs: BTreeMap<(String, String), SchemeSpec> = BTreeMap::new();
    for r in read_tsv(path, 4)?.iter() {
        specs
            .entry((r[0].clone(), r[1].clone()))
            .or_insert_with(|| SchemeSpec::new(&r[0], &r[1]))
            .add_sample(&r[2], &r[3]);
    }
    Ok(specs.into_values().collect())
}

pub fn read_labels(path: &str) -> Result<LabelSet> {
    let mut labels = LabelSet::new();
    for r in read_tsv(path, 3)?.iter() {
        let label: Label = r[2].parse()?;
        let scheme = r.get(3).filter(|s| !s.is_empty());
        let subtype = r.get(4).filter(|s| !s.is_empty());
        match (scheme, subtype) {
            (Some(scheme), Some(subtype)) => {
                labels.insert_override(DiseaseContext::subtype(&r[0], scheme, subtype), &r[1], label);
            }
            (None, None) => {
                labels.insert(&r[0], &r[1], label);
            }
            _ => {
                return Err(ScoringError::Config(format!(
                    "{path}: label override for '{}' needs both scheme and subtype",
                    r[1]
                )))
            }
        }
    }
    Ok(labels)
}

/// Gene set collection named after the file stem. Empty gene fields are
/// skipped.
pub fn read_gmt(path: &str) -> Result<GeneSetCollection> {
    let mut gmt = FileReader::new();
    gmt.read_table(path, '\t', false)
        .map_err(|e| ScoringError::Config(format!("{path}: {e}")))?;
    let mut sets = Vec::with_capacity(gmt.record.len());
    for r in gmt.record.iter() {
        if r.len() < 3 {
            return Err(ScoringError::Config(format!(
                "{path}: gene set '{}' has no genes",
                r[0]
            )));
        }
        sets.push(GeneSet {
            name: r[0].trim().to_string(),
            genes: r[2..]
                .iter()
                .map(|g| g.trim())
                .filter(|g| !g.is_empty())
                .map(|g| g.to_string())
                .collect(),
        });
    }
    let name = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    tracing::info!(path, sets = sets.len(), "gene sets read");
    Ok(GeneSetCollection::new(&name, sets))
}

/// `context  function  rank  drug  score  p_value  label  truncated`
pub fn write_rankings_tsv<W: Write>(outcomes: &[EvaluationOutcome], w: W) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(w);
    let io_err = |e: csv::Error| ScoringError::Io(std::io::Error::new(std::io::ErrorKind::Other, e));
    wtr.write_record([
        "context", "function", "rank", "drug", "score", "p_value", "label", "truncated",
    ])
    .map_err(io_err)?;
    for o in outcomes.iter() {
        let context = o.context.to_string();
        for (i, r) in o.ranking.iter().enumerate() {
            let row: [String; 8] = [
                context.clone(),
                o.function.name().to_string(),
                (i + 1).to_string(),
                r.drug.clone(),
                r.score.to_string(),
                r.p_value.map(|p| p.to_string()).unwrap_or_default(),
                r.label.to_string(),
                r.truncated.to_string(),
            ];
            wtr.write_record(&row).map_err(io_err)?;
        }
    }
    wtr.flush()?;
    Ok(())
}
