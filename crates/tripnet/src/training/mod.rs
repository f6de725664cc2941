//! Training pipeline: triplet sampling and batching, loss functions, the
//! held-out kNN monitor, plateau LR policy, and the optimizer loop.

pub mod loss;
pub mod metrics;
pub mod monitor;
pub mod sampler;
pub mod schedule;
pub mod trainer;
