//! Batched embedding of pool images.
//!
//! Embeddings are recomputed on every call; nothing is cached between
//! epochs because the model changes underneath.

use burn::prelude::*;

use crate::dataset::Pool;
use crate::model::bridge::{images_to_tensor, tensor_to_rows};
use crate::model::embedding_net::EmbeddingNet;

/// Embed the images at `indices` in chunks of `batch_size`.
///
/// Returns one unit-norm `Vec<f32>` per index, in the order given.
pub fn embed_indices<B: Backend>(
    model: &EmbeddingNet<B>,
    pool: &Pool,
    indices: &[usize],
    batch_size: usize,
    device: &B::Device,
) -> Vec<Vec<f32>> {
    let mut embeddings = Vec::with_capacity(indices.len());
    for chunk in indices.chunks(batch_size.max(1)) {
        let images = images_to_tensor::<B>(pool, chunk, device);
        embeddings.extend(tensor_to_rows(model.embed(images)));
    }
    embeddings
}

/// Embed every image of `pool`, in pool order.
pub fn embed_pool<B: Backend>(
    model: &EmbeddingNet<B>,
    pool: &Pool,
    batch_size: usize,
    device: &B::Device,
) -> Vec<Vec<f32>> {
    let indices: Vec<usize> = (0..pool.len()).collect();
    embed_indices(model, pool, &indices, batch_size, device)
}
