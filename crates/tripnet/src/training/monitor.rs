//! Epoch-end nearest-neighbour validation.
//!
//! The monitor embeds the whole held-out pool, then for randomly chosen
//! query entries counts how many of the `top_k` closest embeddings share the
//! query's label. The query itself is part of the candidate set and always
//! ranks first at distance zero.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dataset::{Label, Pool};
use crate::inference::embed_pool;
use crate::model::embedding_net::EmbeddingNet;

/// Lifecycle of one monitor. Cycles `Armed → Running → Reporting` on every
/// [`ValidationMonitor::evaluate`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Holds its pool, no evaluation has run yet.
    Armed,
    /// Embedding the pool and counting neighbours.
    Running,
    /// The last report is available.
    Reporting,
}

/// Result of one validation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    /// Mean number of same-class entries among the `top_k` neighbours.
    pub mean_common: f64,
    pub num_samples: usize,
    /// Neighbour count actually used after clamping to the pool size.
    pub top_k: usize,
}

/// Held-out kNN same-class monitor.
pub struct ValidationMonitor {
    held_out: Pool,
    top_k: usize,
    num_samples: usize,
    rng: StdRng,
    phase: MonitorPhase,
    last: Option<ValidationReport>,
}

impl ValidationMonitor {
    /// Capture the held-out pool. `seed = None` draws queries from entropy.
    pub fn new(held_out: Pool, top_k: usize, num_samples: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            held_out,
            top_k,
            num_samples,
            rng,
            phase: MonitorPhase::Armed,
            last: None,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn held_out(&self) -> &Pool {
        &self.held_out
    }

    /// Most recent report, if any evaluation has completed.
    pub fn last_report(&self) -> Option<&ValidationReport> {
        self.last.as_ref()
    }

    /// Embed the held-out pool with `model` and report the mean common count
    /// over `num_samples` random queries.
    pub fn evaluate<B: Backend>(
        &mut self,
        model: &EmbeddingNet<B>,
        batch_size: usize,
        device: &B::Device,
    ) -> ValidationReport {
        self.phase = MonitorPhase::Running;

        let embeddings = embed_pool(model, &self.held_out, batch_size, device);
        let labels = self.held_out.labels();
        let queries: Vec<usize> = (0..self.num_samples)
            .map(|_| self.rng.gen_range(0..labels.len()))
            .collect();

        let top_k = self.top_k.min(labels.len());
        let mean_common = mean_common_count(&embeddings, &labels, &queries, top_k);
        let report = ValidationReport {
            mean_common,
            num_samples: queries.len(),
            top_k,
        };

        tracing::debug!(
            mean_common,
            top_k,
            num_samples = queries.len(),
            pool = labels.len(),
            "Validation pass complete"
        );

        self.last = Some(report.clone());
        self.phase = MonitorPhase::Reporting;
        report
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Indices of the `k` embeddings closest to `embeddings[query]`, nearest
/// first. The query itself is a candidate. Ties keep ascending index order;
/// `k` is clamped to the number of embeddings.
pub fn top_k_neighbors(embeddings: &[Vec<f32>], query: usize, k: usize) -> Vec<usize> {
    let target = &embeddings[query];
    let mut ranked: Vec<(usize, f32)> = embeddings
        .iter()
        .enumerate()
        .map(|(i, e)| (i, squared_distance(target, e)))
        .collect();
    // Stable sort: equal distances stay in index order.
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked.into_iter().take(k).map(|(i, _)| i).collect()
}

/// Mean over `queries` of the number of top-`k` neighbours whose label
/// matches the query's label. Returns `0.0` for an empty query list.
pub fn mean_common_count(
    embeddings: &[Vec<f32>],
    labels: &[Label],
    queries: &[usize],
    k: usize,
) -> f64 {
    assert_eq!(
        embeddings.len(),
        labels.len(),
        "embedding and label counts differ"
    );
    if queries.is_empty() {
        return 0.0;
    }
    let total: usize = queries
        .iter()
        .map(|&q| {
            top_k_neighbors(embeddings, q, k)
                .into_iter()
                .filter(|&i| labels[i] == labels[q])
                .count()
        })
        .sum();
    total as f64 / queries.len() as f64
}
