//! TOML config loading for the tripnet CLI.
//!
//! Deserializes `configs/train.toml` which has `[model]`, `[training]` and
//! `[data]` sections, then merges with CLI overrides. Every field is
//! optional; priority is built-in defaults < TOML values < CLI flags.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tripnet::{DatasetSource, EmbeddingNetConfig, OptimizerKind, TrainingConfig};

/// Top-level structure matching `configs/train.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct TrainToml {
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub training: TrainingOverrides,
    #[serde(default)]
    pub data: DataSection,
}

/// Optional overrides for `EmbeddingNetConfig`.
///
/// `image_size` is not configurable: it always follows the loaded images.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub embedding_dim: Option<usize>,
    pub num_classes: Option<usize>,
    pub conv1_channels: Option<usize>,
    pub conv2_channels: Option<usize>,
    pub d_hidden: Option<usize>,
    pub conv_dropout: Option<f64>,
    pub dense_dropout: Option<f64>,
}

/// Optional overrides for `TrainingConfig`.
#[derive(Debug, Default, Deserialize)]
pub struct TrainingOverrides {
    pub batch_size: Option<usize>,
    pub steps_per_epoch: Option<usize>,
    pub epochs: Option<usize>,
    pub lr: Option<f64>,
    pub optimizer: Option<OptimizerKind>,
    pub momentum: Option<f64>,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub margin: Option<f64>,
    pub classification_weight: Option<f64>,
    pub top_k: Option<usize>,
    pub num_samples: Option<usize>,
    pub eval_batch_size: Option<usize>,
    pub lr_patience: Option<usize>,
    pub lr_factor: Option<f64>,
    pub lr_floor: Option<f64>,
    pub lr_min_delta: Option<f64>,
    pub log_interval: Option<usize>,
    pub seed: Option<u64>,
}

/// Dataset location and optional pool truncation.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DataSection {
    #[serde(default)]
    pub source: DatasetSource,
    /// Keep at most this many training samples (after shuffling).
    pub max_train: Option<usize>,
    /// Keep at most this many held-out samples (after shuffling).
    pub max_held_out: Option<usize>,
}

/// Training flags that can be given on the command line.
#[derive(Debug, Default, Clone)]
pub struct TrainingCliOverrides {
    pub epochs: Option<usize>,
    pub steps_per_epoch: Option<usize>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
    pub seed: Option<u64>,
}

/// Data flags that can be given on the command line.
#[derive(Debug, Default, Clone)]
pub struct DataCliOverrides {
    /// Directory of IDX files; replaces the configured source.
    pub data_dir: Option<PathBuf>,
    pub max_train: Option<usize>,
    pub max_held_out: Option<usize>,
}

/// Load and deserialize a `TrainToml` from a TOML file.
pub fn load_train_toml(path: &Path) -> anyhow::Result<TrainToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: TrainToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded train config");
    Ok(config)
}

/// Apply `[model]` overrides on top of the built-in defaults.
pub fn build_model_config(overrides: &ModelOverrides) -> EmbeddingNetConfig {
    let mut config = EmbeddingNetConfig::new();
    if let Some(v) = overrides.embedding_dim {
        config.embedding_dim = v;
    }
    if let Some(v) = overrides.num_classes {
        config.num_classes = v;
    }
    if let Some(v) = overrides.conv1_channels {
        config.conv1_channels = v;
    }
    if let Some(v) = overrides.conv2_channels {
        config.conv2_channels = v;
    }
    if let Some(v) = overrides.d_hidden {
        config.d_hidden = v;
    }
    if let Some(v) = overrides.conv_dropout {
        config.conv_dropout = v;
    }
    if let Some(v) = overrides.dense_dropout {
        config.dense_dropout = v;
    }
    config
}

/// Build a `TrainingConfig` from defaults, `[training]` values, and CLI flags.
pub fn build_training_config(
    overrides: &TrainingOverrides,
    cli: &TrainingCliOverrides,
) -> TrainingConfig {
    let mut config = TrainingConfig::new();

    // TOML overrides
    if let Some(v) = overrides.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = overrides.steps_per_epoch {
        config.steps_per_epoch = v;
    }
    if let Some(v) = overrides.epochs {
        config.epochs = v;
    }
    if let Some(v) = overrides.lr {
        config.lr = v;
    }
    if let Some(v) = overrides.optimizer {
        config.optimizer = v;
    }
    if let Some(v) = overrides.momentum {
        config.momentum = v;
    }
    if let Some(v) = overrides.weight_decay {
        config.weight_decay = v;
    }
    if overrides.max_grad_norm.is_some() {
        config.max_grad_norm = overrides.max_grad_norm;
    }
    if let Some(v) = overrides.margin {
        config.margin = v;
    }
    if let Some(v) = overrides.classification_weight {
        config.classification_weight = v;
    }
    if let Some(v) = overrides.top_k {
        config.top_k = v;
    }
    if let Some(v) = overrides.num_samples {
        config.num_samples = v;
    }
    if let Some(v) = overrides.eval_batch_size {
        config.eval_batch_size = v;
    }
    if let Some(v) = overrides.lr_patience {
        config.lr_patience = v;
    }
    if let Some(v) = overrides.lr_factor {
        config.lr_factor = v;
    }
    if let Some(v) = overrides.lr_floor {
        config.lr_floor = v;
    }
    if let Some(v) = overrides.lr_min_delta {
        config.lr_min_delta = v;
    }
    if let Some(v) = overrides.log_interval {
        config.log_interval = v;
    }
    if overrides.seed.is_some() {
        config.seed = overrides.seed;
    }

    // CLI flags take highest priority
    if let Some(v) = cli.epochs {
        config.epochs = v;
    }
    if let Some(v) = cli.steps_per_epoch {
        config.steps_per_epoch = v;
    }
    if let Some(v) = cli.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = cli.lr {
        config.lr = v;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    config
}

/// Merge CLI data flags into the `[data]` section.
pub fn resolve_data_section(mut data: DataSection, cli: &DataCliOverrides) -> DataSection {
    if let Some(dir) = &cli.data_dir {
        data.source = DatasetSource::Idx { dir: dir.clone() };
    }
    if cli.max_train.is_some() {
        data.max_train = cli.max_train;
    }
    if cli.max_held_out.is_some() {
        data.max_held_out = cli.max_held_out;
    }
    data
}
