use rand::rngs::SmallRng; // use SmallRng intestad of StdRng to speedup shuffling
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

pub trait EnrichmentScoreTrait {
    /// fast GSEA only ES value return. `hits` are sorted positions of the set
    fn fast_random_walk(&self, metric: &[f64], hits: &[usize]) -> f64;
}

/// Weighted Kolmogorov-Smirnov running sum on a ranked list with gene
/// permutation nulls drawn from a seeded `SmallRng`.
#[derive(Debug)]
pub struct EnrichmentScore {
    order: Vec<usize>, // current shuffled position map
    nperm: usize,      // number of permutations
    rng: SmallRng,
}

impl EnrichmentScoreTrait for EnrichmentScore {
    /// see here: https://github.com/ctlab/fgsea/blob/master/src/esCalculation.cpp
    fn fast_random_walk(&self, metric: &[f64], hits: &[usize]) -> f64 {
        let ns: f64 = hits.iter().map(|&i| metric[i]).sum::<f64>();
        let n: f64 = metric.len() as f64;
        let k: f64 = hits.len() as f64;
        if hits.is_empty() || ns <= 0.0 {
            return 0.0;
        }
        let mut res: f64 = 0.0; // running_es
        let mut cur: f64 = 0.0;
        // a set covering the whole list never steps down
        let q1: f64 = if n > k { 1.0 / (n - k) } else { 0.0 };
        let q2: f64 = 1.0 / ns;
        let mut last: f64 = -1.0;
        for &pos in hits {
            let p = pos as f64;
            cur -= q1 * (p - last - 1.0);
            if cur.abs() > res.abs() {
                res = cur;
            }
            cur += q2 * metric[pos];
            if cur.abs() > res.abs() {
                res = cur;
            }
            last = p;
        }
        res
    }
}

/// associate and memeber function
impl EnrichmentScore {
    pub fn new(n_genes: usize, nperm: usize, seed: u64) -> Self {
        EnrichmentScore {
            order: (0..n_genes).collect(),
            nperm,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn nperm(&self) -> usize {
        self.nperm
    }

    /// gene permutation procedure.
    /// draw the next `count` shuffled position maps: perm[i] is the new position
    /// of the gene ranked i. Each map reshuffles the previous one, so the stream
    /// only depends on the seed, not on how it is chunked.
    pub fn gene_permutation(&mut self, count: usize) -> Vec<Vec<usize>> {
        let mut gperm: Vec<Vec<usize>> = Vec::with_capacity(count);
        for _ in 0..count {
            // inplace shuffle
            self.order.shuffle(&mut self.rng);
            gperm.push(self.order.clone());
        }
        gperm
    }

    /// ES of every gene set (given as sorted hit positions) under each
    /// permutation of a chunk. result[p][s] is set s under permutation p.
    pub fn enrichment_score_gene(
        &self,
        metric: &[f64],
        hit_sets: &[Vec<usize>],
        gperm: &[Vec<usize>],
    ) -> Vec<Vec<f64>> {
        gperm
            .par_iter()
            .map(|perm| {
                hit_sets
                    .iter()
                    .map(|hits| {
                        let mut shuffled: Vec<usize> = hits.iter().map(|&i| perm[i]).collect();
                        shuffled.sort_unstable();
                        self.fast_random_walk(metric, &shuffled)
                    })
                    .collect()
            })
            .collect()
    }
}
