//! Triplet-regularized training loop.
//!
//! Ties together the batch assembler, the embedding network, both loss terms,
//! the validation monitor and the plateau scheduler. Each epoch runs a fixed
//! number of optimizer steps followed by one held-out kNN evaluation.

use std::fmt;
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::dataset::Pool;
use crate::error::TripletError;
use crate::model::bridge::tensor_to_f64;
use crate::model::embedding_net::EmbeddingNet;
use crate::training::loss::{classification_loss, triplet_loss};
use crate::training::metrics::{EpochMetrics, MetricsHistory, RunningAvg};
use crate::training::monitor::ValidationMonitor;
use crate::training::sampler::{BatchAssembler, TripletSampler};
use crate::training::schedule::PlateauScheduler;

/// Gradient-descent flavour used by [`train`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Plain SGD, optionally with momentum.
    Sgd,
    /// AdamW with decoupled weight decay.
    AdamW,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "SGD"),
            OptimizerKind::AdamW => write!(f, "AdamW"),
        }
    }
}

/// Configuration for triplet training.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Triplets per optimizer step (each step sees 3x this many images).
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 500)]
    pub steps_per_epoch: usize,
    #[config(default = 50)]
    pub epochs: usize,
    /// Initial learning rate.
    #[config(default = 0.01)]
    pub lr: f64,
    #[config(default = "OptimizerKind::Sgd")]
    pub optimizer: OptimizerKind,
    /// SGD momentum. Zero disables it; ignored by AdamW.
    #[config(default = 0.0)]
    pub momentum: f64,
    #[config(default = 0.0)]
    pub weight_decay: f64,
    /// Gradient norm clipping threshold.
    #[config(default = "None")]
    pub max_grad_norm: Option<f64>,
    /// Required gap between negative and positive squared distances.
    #[config(default = 0.2)]
    pub margin: f64,
    /// Weight of the cross-entropy term relative to the triplet term.
    #[config(default = 1.0)]
    pub classification_weight: f64,
    /// Neighbours inspected per validation query.
    #[config(default = 100)]
    pub top_k: usize,
    /// Validation queries per epoch.
    #[config(default = 400)]
    pub num_samples: usize,
    /// Batch size for held-out inference.
    #[config(default = 256)]
    pub eval_batch_size: usize,
    /// Epochs without loss improvement before the LR is reduced.
    #[config(default = 4)]
    pub lr_patience: usize,
    #[config(default = 0.1)]
    pub lr_factor: f64,
    #[config(default = 1e-8)]
    pub lr_floor: f64,
    /// Minimum epoch-loss decrease that counts as an improvement.
    #[config(default = 1e-4)]
    pub lr_min_delta: f64,
    /// Steps between progress log lines (0 disables).
    #[config(default = 100)]
    pub log_interval: usize,
    /// Base seed; the sampler, monitor, model init and pool shuffle each derive their own.
    #[config(default = "None")]
    pub seed: Option<u64>,
}

impl TrainingConfig {
    /// Check the values the loop relies on.
    pub fn validate(&self) -> Result<(), TripletError> {
        if self.batch_size == 0 || self.steps_per_epoch == 0 || self.eval_batch_size == 0 {
            return Err(TripletError::InvalidConfig(
                "batch_size, steps_per_epoch and eval_batch_size must be positive".to_string(),
            ));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(TripletError::InvalidConfig(format!(
                "lr must be positive, got {}",
                self.lr
            )));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(TripletError::InvalidConfig(format!(
                "lr_factor must be in (0, 1), got {}",
                self.lr_factor
            )));
        }
        if self.top_k == 0 {
            return Err(TripletError::InvalidConfig(
                "top_k must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sampler_seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn monitor_seed(&self) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(1))
    }

    pub fn init_seed(&self) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(2))
    }

    /// Seed for the one-time pool shuffle at load.
    pub fn shuffle_seed(&self) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(3))
    }
}

fn check_finite(step: usize, value: f64) -> Result<(), TripletError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TripletError::NonFiniteLoss { step, value })
    }
}

/// Run the training loop for `config.epochs` epochs.
///
/// The training pool is validated before the first step. Every step draws a
/// fresh triplet batch, minimizes `triplet + classification_weight * ce`, and
/// aborts with [`TripletError::NonFiniteLoss`] (global step index) if the loss
/// leaves the finite range. After each epoch the `monitor` evaluates the
/// inference copy of the model and the plateau scheduler sees the epoch's
/// mean loss.
///
/// # Returns
/// The trained model and one [`EpochMetrics`] per epoch.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    model: EmbeddingNet<B>,
    train_pool: &Pool,
    monitor: &mut ValidationMonitor,
    device: &B::Device,
) -> anyhow::Result<(EmbeddingNet<B>, MetricsHistory)> {
    config.validate()?;

    let num_classes = model.num_classes();
    if let Some(&max_label) = train_pool.classes().last() {
        if max_label as usize >= num_classes {
            return Err(TripletError::InvalidConfig(format!(
                "label {max_label} is out of range for {num_classes} classes"
            ))
            .into());
        }
    }

    let clipping = config
        .max_grad_norm
        .map(|norm| GradientClippingConfig::Norm(norm as f32));

    tracing::info!(
        optimizer = %config.optimizer,
        lr = config.lr,
        batch_size = config.batch_size,
        steps_per_epoch = config.steps_per_epoch,
        epochs = config.epochs,
        margin = config.margin,
        "Starting triplet training"
    );

    match config.optimizer {
        OptimizerKind::Sgd => {
            let momentum = (config.momentum > 0.0).then(|| {
                MomentumConfig::new()
                    .with_momentum(config.momentum)
                    .with_dampening(0.0)
            });
            let weight_decay = (config.weight_decay > 0.0)
                .then(|| WeightDecayConfig::new(config.weight_decay as f32));
            let optimizer = SgdConfig::new()
                .with_momentum(momentum)
                .with_weight_decay(weight_decay)
                .with_gradient_clipping(clipping)
                .init();
            run_epochs(config, model, train_pool, monitor, optimizer, device)
        }
        OptimizerKind::AdamW => {
            let optimizer = AdamWConfig::new()
                .with_weight_decay(config.weight_decay as f32)
                .with_grad_clipping(clipping)
                .init();
            run_epochs(config, model, train_pool, monitor, optimizer, device)
        }
    }
}

fn run_epochs<B, O>(
    config: &TrainingConfig,
    mut model: EmbeddingNet<B>,
    train_pool: &Pool,
    monitor: &mut ValidationMonitor,
    mut optimizer: O,
    device: &B::Device,
) -> anyhow::Result<(EmbeddingNet<B>, MetricsHistory)>
where
    B: AutodiffBackend,
    O: Optimizer<EmbeddingNet<B>, B>,
{
    let embedding_dim = model.embedding_dim();
    let sampler = TripletSampler::seeded(train_pool, config.sampler_seed())?;
    let mut batches = BatchAssembler::new(sampler, config.batch_size, embedding_dim)?;

    let mut scheduler = PlateauScheduler::new(
        config.lr,
        config.lr_factor,
        config.lr_patience,
        config.lr_floor,
        config.lr_min_delta,
    );
    let mut history = MetricsHistory::new();
    let mut interval_avg = RunningAvg::new();
    let train_start = Instant::now();

    for epoch in 0..config.epochs {
        let lr = scheduler.lr();
        let mut epoch_avg = RunningAvg::new();

        for step_in_epoch in 0..config.steps_per_epoch {
            let step = epoch * config.steps_per_epoch + step_in_epoch;

            let batch = batches.next_batch();
            let tensors = batch.to_tensors::<B>(train_pool, device);
            let output = model.forward(tensors.images);

            if output.embeddings.dims() != tensors.targets.dims() {
                anyhow::bail!(
                    "embedding shape {:?} does not match target shape {:?}",
                    output.embeddings.dims(),
                    tensors.targets.dims()
                );
            }

            let triplet = triplet_loss(output.embeddings, batch.num_triplets, config.margin);
            let ce = classification_loss(output.logits, tensors.labels);
            let triplet_val = tensor_to_f64(triplet.clone());
            let ce_val = tensor_to_f64(ce.clone());

            let total = triplet + ce * config.classification_weight;
            let total_val = tensor_to_f64(total.clone());
            check_finite(step, total_val)?;

            let grads = GradientsParams::from_grads(total.backward(), &model);
            model = optimizer.step(lr, model, grads);

            epoch_avg.update(total_val, triplet_val, ce_val);
            interval_avg.update(total_val, triplet_val, ce_val);

            if config.log_interval > 0 && (step + 1) % config.log_interval == 0 {
                tracing::info!(
                    epoch,
                    step = step + 1,
                    lr = %format!("{lr:.2e}"),
                    "avg({}) {}",
                    interval_avg.count(),
                    interval_avg.display()
                );
                interval_avg.reset();
            }
        }

        let report = monitor.evaluate(&model.valid(), config.eval_batch_size, device);
        let (loss, triplet_mean, ce_mean) = epoch_avg.means().unwrap_or((0.0, 0.0, 0.0));
        scheduler.step(loss);

        tracing::info!(
            epoch,
            loss = format!("{loss:.4}"),
            triplet = format!("{triplet_mean:.4}"),
            ce = format!("{ce_mean:.4}"),
            lr = %format!("{lr:.2e}"),
            mean_common = format!("{:.2}", report.mean_common),
            top_k = report.top_k,
            "Epoch complete"
        );

        history.push(EpochMetrics {
            epoch,
            loss,
            triplet_loss: triplet_mean,
            classification_loss: ce_mean,
            lr,
            mean_common: report.mean_common,
        });
    }

    tracing::info!(
        epochs = config.epochs,
        total_steps = config.epochs * config.steps_per_epoch,
        best_mean_common = history.best().map(|m| m.mean_common),
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training loop finished"
    );

    Ok((model, history))
}
