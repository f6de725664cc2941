//! Triplet-regularized convolutional embeddings for digit images.
//!
//! Trains a small LeNet-style network whose L2-normalized embeddings are
//! shaped by a margin triplet loss alongside a cross-entropy classifier, and
//! tracks a held-out nearest-neighbour metric after every epoch.

pub mod dataset;
pub mod error;
pub mod export;
pub mod inference;
pub mod model;
pub mod training;

pub use dataset::{load_dataset, DatasetSource, Image, Label, Pool, Sample, SplitPools};
pub use error::TripletError;
pub use export::EmbeddingTable;
pub use inference::{embed_indices, embed_pool};
pub use model::embedding_net::{EmbeddingNet, EmbeddingNetConfig, EmbeddingOutput};
pub use training::metrics::{EpochMetrics, MetricsHistory};
pub use training::monitor::{MonitorPhase, ValidationMonitor, ValidationReport};
pub use training::sampler::{BatchAssembler, Triplet, TripletBatch, TripletSampler};
pub use training::schedule::PlateauScheduler;
pub use training::trainer::{train, OptimizerKind, TrainingConfig};
