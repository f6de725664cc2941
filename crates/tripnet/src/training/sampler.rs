//! Triplet sampling and batch assembly.
//!
//! [`TripletSampler`] is an unbounded pull-based iterator over a borrowed
//! [`Pool`]; it owns its RNG so independent sampling paths never share
//! random state. [`BatchAssembler`] stacks N triplets into the
//! `[anchors][positives][negatives]` layout the triplet loss expects.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::dataset::{Label, Pool};
use crate::error::TripletError;
use crate::model::bridge::{images_to_tensor, labels_to_tensor, rows_to_tensor};

/// Minimum samples per class: an anchor and a distinct positive.
const MIN_CLASS_SIZE: usize = 2;

/// Pool indices of one (anchor, positive, negative) triplet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Triplet {
    pub anchor: usize,
    pub positive: usize,
    pub negative: usize,
    /// Shared label of anchor and positive.
    pub anchor_label: Label,
    pub negative_label: Label,
}

/// Infinite random triplet stream over a labeled pool.
///
/// Each draw picks an anchor class uniformly, a negative class uniformly
/// among the other classes, two distinct anchor-class samples, and one
/// negative-class sample. Draws are independent of each other.
pub struct TripletSampler<'a, R: Rng = StdRng> {
    pool: &'a Pool,
    classes: Vec<Label>,
    rng: R,
}

impl<'a> TripletSampler<'a, StdRng> {
    /// Sampler over a `StdRng` seeded from `seed`, or from entropy when `None`.
    pub fn seeded(pool: &'a Pool, seed: Option<u64>) -> Result<Self, TripletError> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self::new(pool, rng)
    }
}

impl<'a, R: Rng> TripletSampler<'a, R> {
    /// Create a sampler, validating the pool up front.
    ///
    /// # Errors
    /// - [`TripletError::TooFewClasses`] if the pool has fewer than 2 classes
    /// - [`TripletError::ClassTooSmall`] if any class has fewer than 2 samples
    pub fn new(pool: &'a Pool, rng: R) -> Result<Self, TripletError> {
        validate_pool(pool)?;
        Ok(Self {
            pool,
            classes: pool.classes(),
            rng,
        })
    }

    pub fn pool(&self) -> &'a Pool {
        self.pool
    }

    /// Draw one triplet.
    pub fn sample(&mut self) -> Triplet {
        let n = self.classes.len();
        let anchor_slot = self.rng.gen_range(0..n);
        // Uniform over the n - 1 other classes: skip past the anchor slot.
        let mut negative_slot = self.rng.gen_range(0..n - 1);
        if negative_slot >= anchor_slot {
            negative_slot += 1;
        }
        let anchor_label = self.classes[anchor_slot];
        let negative_label = self.classes[negative_slot];
        debug_assert_ne!(anchor_label, negative_label);

        let anchor_pool = self.pool.class_indices(anchor_label);
        let picked = rand::seq::index::sample(&mut self.rng, anchor_pool.len(), 2);
        let anchor = anchor_pool[picked.index(0)];
        let positive = anchor_pool[picked.index(1)];

        let negative = *self
            .pool
            .class_indices(negative_label)
            .choose(&mut self.rng)
            .expect("validated classes are non-empty");

        Triplet {
            anchor,
            positive,
            negative,
            anchor_label,
            negative_label,
        }
    }
}

impl<R: Rng> Iterator for TripletSampler<'_, R> {
    type Item = Triplet;

    fn next(&mut self) -> Option<Triplet> {
        Some(self.sample())
    }
}

/// Check that every class can supply an anchor/positive pair and that a
/// distinct negative class exists.
pub fn validate_pool(pool: &Pool) -> Result<(), TripletError> {
    let counts = pool.class_counts();
    if counts.len() < 2 {
        return Err(TripletError::TooFewClasses {
            found: counts.len(),
        });
    }
    for (label, count) in counts {
        if count < MIN_CLASS_SIZE {
            return Err(TripletError::ClassTooSmall {
                label,
                count,
                required: MIN_CLASS_SIZE,
            });
        }
    }
    Ok(())
}

/// N triplets flattened into `[N anchors][N positives][N negatives]`.
#[derive(Clone, Debug)]
pub struct TripletBatch {
    /// Pool indices, length 3N.
    pub indices: Vec<usize>,
    /// Labels of `indices`, length 3N.
    pub labels: Vec<Label>,
    /// Placeholder targets: 3N rows of `embedding_dim` zeros. The triplet
    /// objective is computed from the embeddings alone.
    pub targets: Vec<Vec<f32>>,
    /// N.
    pub num_triplets: usize,
}

/// Tensor form of a [`TripletBatch`].
#[derive(Debug, Clone)]
pub struct BatchTensors<B: Backend> {
    /// `(3N, 1, height, width)`.
    pub images: Tensor<B, 4>,
    /// `(3N,)`.
    pub labels: Tensor<B, 1, Int>,
    /// `(3N, embedding_dim)`, all zero.
    pub targets: Tensor<B, 2>,
}

impl TripletBatch {
    /// Stack triplets into the three-block layout.
    pub fn from_triplets(pool: &Pool, triplets: &[Triplet], embedding_dim: usize) -> Self {
        let n = triplets.len();
        let mut indices = Vec::with_capacity(3 * n);
        indices.extend(triplets.iter().map(|t| t.anchor));
        indices.extend(triplets.iter().map(|t| t.positive));
        indices.extend(triplets.iter().map(|t| t.negative));

        let labels = indices.iter().map(|&i| pool.label(i)).collect();
        let targets = vec![vec![0.0_f32; embedding_dim]; 3 * n];

        Self {
            indices,
            labels,
            targets,
            num_triplets: n,
        }
    }

    /// Number of rows (3N).
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn anchors(&self) -> &[usize] {
        &self.indices[..self.num_triplets]
    }

    pub fn positives(&self) -> &[usize] {
        &self.indices[self.num_triplets..2 * self.num_triplets]
    }

    pub fn negatives(&self) -> &[usize] {
        &self.indices[2 * self.num_triplets..]
    }

    /// Convert to burn tensors on `device`.
    pub fn to_tensors<B: Backend>(&self, pool: &Pool, device: &B::Device) -> BatchTensors<B> {
        BatchTensors {
            images: images_to_tensor::<B>(pool, &self.indices, device),
            labels: labels_to_tensor::<B>(&self.labels, device),
            targets: rows_to_tensor::<B>(&self.targets, device),
        }
    }
}

/// Pulls fixed-size batches of triplets from a [`TripletSampler`].
pub struct BatchAssembler<'a, R: Rng = StdRng> {
    sampler: TripletSampler<'a, R>,
    batch_size: usize,
    embedding_dim: usize,
}

impl<'a, R: Rng> BatchAssembler<'a, R> {
    /// # Errors
    /// Returns [`TripletError::InvalidConfig`] if `batch_size` or
    /// `embedding_dim` is zero.
    pub fn new(
        sampler: TripletSampler<'a, R>,
        batch_size: usize,
        embedding_dim: usize,
    ) -> Result<Self, TripletError> {
        if batch_size == 0 {
            return Err(TripletError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if embedding_dim == 0 {
            return Err(TripletError::InvalidConfig(
                "embedding_dim must be positive".to_string(),
            ));
        }
        Ok(Self {
            sampler,
            batch_size,
            embedding_dim,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pool(&self) -> &'a Pool {
        self.sampler.pool()
    }

    /// Draw `batch_size` triplets and stack them.
    pub fn next_batch(&mut self) -> TripletBatch {
        let triplets: Vec<Triplet> = (&mut self.sampler).take(self.batch_size).collect();
        TripletBatch::from_triplets(self.sampler.pool(), &triplets, self.embedding_dim)
    }
}

impl<R: Rng> Iterator for BatchAssembler<'_, R> {
    type Item = TripletBatch;

    fn next(&mut self) -> Option<TripletBatch> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::make_pool;
    use crate::dataset::{Image, Sample};
    use burn::backend::ndarray::NdArray;
    use std::collections::HashMap;

    type TestBackend = NdArray<f32>;

    fn seeded_rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn test_triplet_invariants() {
        let pool = make_pool(&[0, 1, 2, 3, 4], 6);
        let sampler = TripletSampler::new(&pool, seeded_rng(11)).unwrap();
        for t in sampler.take(2_000) {
            assert_ne!(t.anchor, t.positive, "anchor and positive must be distinct entries");
            assert_eq!(pool.label(t.anchor), pool.label(t.positive));
            assert_ne!(pool.label(t.negative), pool.label(t.anchor));
            assert_eq!(t.anchor_label, pool.label(t.anchor));
            assert_eq!(t.negative_label, pool.label(t.negative));
        }
    }

    #[test]
    fn test_two_class_pool_terminates() {
        let pool = make_pool(&[4, 9], 2);
        let mut sampler = TripletSampler::new(&pool, seeded_rng(3)).unwrap();
        for _ in 0..500 {
            let t = sampler.sample();
            let expected_negative = if t.anchor_label == 4 { 9 } else { 4 };
            assert_eq!(t.negative_label, expected_negative);
        }
    }

    #[test]
    fn test_anchor_classes_roughly_uniform() {
        let pool = make_pool(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], 5);
        let sampler = TripletSampler::new(&pool, seeded_rng(2024)).unwrap();

        let mut counts: HashMap<Label, usize> = HashMap::new();
        for t in sampler.take(10_000) {
            *counts.entry(t.anchor_label).or_default() += 1;
        }
        assert_eq!(counts.len(), 10);
        for (label, count) in counts {
            assert!(
                (800..=1200).contains(&count),
                "class {label} drawn {count} times out of 10000"
            );
        }
    }

    #[test]
    fn test_seeded_samplers_repeat() {
        let pool = make_pool(&[0, 1, 2], 4);
        let a: Vec<Triplet> = TripletSampler::seeded(&pool, Some(5)).unwrap().take(20).collect();
        let b: Vec<Triplet> = TripletSampler::seeded(&pool, Some(5)).unwrap().take(20).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_class_rejected() {
        let pool = make_pool(&[3], 10);
        let err = TripletSampler::new(&pool, seeded_rng(0)).err().unwrap();
        assert!(matches!(err, TripletError::TooFewClasses { found: 1 }));
    }

    #[test]
    fn test_class_too_small_rejected() {
        let mut samples: Vec<Sample> = (0..3)
            .map(|_| Sample {
                image: Image::new(4, 4, vec![0.0; 16]).unwrap(),
                label: 0,
            })
            .collect();
        samples.push(Sample {
            image: Image::new(4, 4, vec![1.0; 16]).unwrap(),
            label: 5,
        });
        let pool = Pool::new(samples).unwrap();
        let err = TripletSampler::new(&pool, seeded_rng(0)).err().unwrap();
        assert!(matches!(
            err,
            TripletError::ClassTooSmall { label: 5, count: 1, required: 2 }
        ));
    }

    #[test]
    fn test_batch_layout() {
        let pool = make_pool(&[0, 1, 2], 4);
        let sampler = TripletSampler::new(&pool, seeded_rng(9)).unwrap();
        let mut assembler = BatchAssembler::new(sampler, 5, 8).unwrap();
        let batch = assembler.next_batch();

        assert_eq!(batch.num_triplets, 5);
        assert_eq!(batch.len(), 15);
        assert_eq!(batch.labels.len(), 15);
        assert_eq!(batch.targets.len(), 15);
        assert!(batch.targets.iter().all(|row| row.len() == 8));
        assert!(batch.targets.iter().flatten().all(|&v| v == 0.0));

        for i in 0..5 {
            let (a, p, n) = (batch.anchors()[i], batch.positives()[i], batch.negatives()[i]);
            assert_ne!(a, p);
            assert_eq!(pool.label(a), pool.label(p));
            assert_ne!(pool.label(a), pool.label(n));
            assert_eq!(batch.labels[i], pool.label(a));
            assert_eq!(batch.labels[5 + i], pool.label(p));
            assert_eq!(batch.labels[10 + i], pool.label(n));
        }
    }

    #[test]
    fn test_batch_from_fixed_triplets() {
        let pool = make_pool(&[0, 1], 3);
        let triplets = [
            Triplet { anchor: 0, positive: 1, negative: 3, anchor_label: 0, negative_label: 1 },
            Triplet { anchor: 4, positive: 5, negative: 2, anchor_label: 1, negative_label: 0 },
        ];
        let batch = TripletBatch::from_triplets(&pool, &triplets, 2);
        assert_eq!(batch.indices, vec![0, 4, 1, 5, 3, 2]);
        assert_eq!(batch.labels, vec![0, 1, 0, 1, 1, 0]);
    }

    #[test]
    fn test_batch_tensors_shapes() {
        let device = Default::default();
        let pool = make_pool(&[0, 1], 3);
        let sampler = TripletSampler::new(&pool, seeded_rng(1)).unwrap();
        let batch = BatchAssembler::new(sampler, 4, 6).unwrap().next().unwrap();
        let tensors = batch.to_tensors::<TestBackend>(&pool, &device);
        assert_eq!(tensors.images.dims(), [12, 1, 6, 6]);
        assert_eq!(tensors.labels.dims(), [12]);
        assert_eq!(tensors.targets.dims(), [12, 6]);
        let total: f32 = tensors.targets.abs().sum().into_scalar().elem();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let pool = make_pool(&[0, 1], 2);
        let sampler = TripletSampler::new(&pool, seeded_rng(1)).unwrap();
        assert!(matches!(
            BatchAssembler::new(sampler, 0, 4),
            Err(TripletError::InvalidConfig(_))
        ));
    }
}
