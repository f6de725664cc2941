//! Train and sample pipelines behind the CLI subcommands.

use std::path::PathBuf;
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use tripnet::{
    load_dataset, train, BatchAssembler, EmbeddingTable, MetricsHistory, SplitPools,
    TripletBatch, TripletSampler, ValidationMonitor,
};

use crate::config::{
    build_model_config, build_training_config, load_train_toml, resolve_data_section,
    DataCliOverrides, DataSection, TrainingCliOverrides,
};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the train config TOML file.
    pub config: PathBuf,
    pub training: TrainingCliOverrides,
    pub data: DataCliOverrides,
    /// Write held-out embeddings to this Parquet file after training.
    pub export_embeddings: Option<PathBuf>,
    /// Write per-epoch metrics to this JSON file.
    pub history: Option<PathBuf>,
}

/// Arguments for the `sample` subcommand.
#[derive(Debug)]
pub struct SampleArgs {
    pub config: PathBuf,
    /// Number of triplets to draw.
    pub triplets: usize,
    pub seed: Option<u64>,
    pub data: DataCliOverrides,
}

/// Load both pools, shuffle them once, and apply the configured truncation.
fn load_pools(data: &DataSection, seed: Option<u64>) -> anyhow::Result<SplitPools> {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let mut pools = load_dataset(&data.source, &mut rng)?;
    if let Some(max) = data.max_train {
        pools.train = pools
            .train
            .truncated(max)
            .map_err(|e| anyhow::anyhow!("Invalid max_train: {e}"))?;
    }
    if let Some(max) = data.max_held_out {
        pools.held_out = pools
            .held_out
            .truncated(max)
            .map_err(|e| anyhow::anyhow!("Invalid max_held_out: {e}"))?;
    }
    tracing::info!(
        train = pools.train.len(),
        held_out = pools.held_out.len(),
        "Pools ready"
    );
    Ok(pools)
}

/// Train the embedding network and optionally export embeddings and metrics.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Load config
    let toml = load_train_toml(&args.config)?;
    let training = build_training_config(&toml.training, &args.training);
    training.validate()?;
    let data = resolve_data_section(toml.data, &args.data);

    // 2. Load data
    let pools = load_pools(&data, training.shuffle_seed())?;
    let (height, width) = pools.train.image_shape();
    if height != width {
        anyhow::bail!("Images must be square, got {height}x{width}");
    }
    if pools.held_out.image_shape() != (height, width) {
        anyhow::bail!(
            "Held-out images are {:?}, training images are {height}x{width}",
            pools.held_out.image_shape()
        );
    }

    // 3. Build model
    let model_config = build_model_config(&toml.model).with_image_size(height);
    model_config.validate()?;
    let device = Default::default();
    if let Some(seed) = training.init_seed() {
        TrainBackend::seed(seed);
    }
    let model = model_config.init::<TrainBackend>(&device);
    tracing::info!(
        embedding_dim = model_config.embedding_dim,
        num_classes = model_config.num_classes,
        image_size = model_config.image_size,
        "Initialized embedding network"
    );

    // 4. Train
    let mut monitor = ValidationMonitor::new(
        pools.held_out.clone(),
        training.top_k,
        training.num_samples,
        training.monitor_seed(),
    );
    let (model, history) = train(&training, model, &pools.train, &mut monitor, &device)?;

    // 5. Outputs
    if let Some(path) = &args.history {
        history.save_json(path)?;
        tracing::info!(path = %path.display(), "Saved metrics history");
    }
    if let Some(path) = &args.export_embeddings {
        let table =
            EmbeddingTable::compute(&model.valid(), &pools.held_out, training.eval_batch_size, &device)?;
        table.save(path)?;
    }

    // 6. Print summary
    println!("\n--- Training Summary ---");
    println!("Epochs: {}", history.len());
    if let Some(last) = history.last() {
        println!("Final loss: {:.4}", last.loss);
        println!("Final mean common (top {}): {:.2}", training.top_k, last.mean_common);
    }
    if let Some(best) = history.best() {
        println!("Best mean common: {:.2} (epoch {})", best.mean_common, best.epoch);
    }
    println!("{}", trend_line(&history, TREND_WINDOW));
    if let Some(path) = &args.export_embeddings {
        println!("Embeddings: {}", path.display());
    }
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Epochs inspected for the closing trend line.
const TREND_WINDOW: usize = 3;

/// Compare the last `window` epochs' loss against the `window` before them.
pub fn trend_line(history: &MetricsHistory, window: usize) -> String {
    if history.len() < 2 * window {
        format!("Loss trend: need {} epochs to compare", 2 * window)
    } else if history.is_improving(window) {
        format!("Loss trend: still decreasing over the last {window} epochs")
    } else {
        format!("Loss trend: stalled over the last {window} epochs")
    }
}

/// One line per triplet: pool indices and labels of anchor, positive, negative.
pub fn format_batch(batch: &TripletBatch) -> Vec<String> {
    let n = batch.num_triplets;
    (0..n)
        .map(|i| {
            format!(
                "{i:>4}  anchor={} ({})  positive={} ({})  negative={} ({})",
                batch.anchors()[i],
                batch.labels[i],
                batch.positives()[i],
                batch.labels[n + i],
                batch.negatives()[i],
                batch.labels[2 * n + i],
            )
        })
        .collect()
}

/// Draw one batch of triplets from the training pool and print it.
pub fn run_sample(args: SampleArgs) -> anyhow::Result<()> {
    let toml = load_train_toml(&args.config)?;
    let training = build_training_config(
        &toml.training,
        &TrainingCliOverrides {
            seed: args.seed,
            ..Default::default()
        },
    );
    let data = resolve_data_section(toml.data, &args.data);
    let embedding_dim = build_model_config(&toml.model).embedding_dim;

    let pools = load_pools(&data, training.shuffle_seed())?;
    let sampler = TripletSampler::seeded(&pools.train, training.sampler_seed())?;
    let mut assembler = BatchAssembler::new(sampler, args.triplets, embedding_dim)?;
    let batch = assembler.next_batch();

    println!(
        "--- {} triplets ({} rows, targets {}x{}) ---",
        batch.num_triplets,
        batch.len(),
        batch.targets.len(),
        embedding_dim
    );
    for line in format_batch(&batch) {
        println!("{line}");
    }
    Ok(())
}
