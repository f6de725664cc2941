mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{DataCliOverrides, TrainingCliOverrides};
use pipeline::{SampleArgs, TrainArgs};

/// tripnet: triplet-regularized embedding network for digit images.
#[derive(Parser)]
#[command(name = "tripnet", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training and triplet inspection.
#[derive(Subcommand)]
enum Command {
    /// Train the embedding network and report held-out kNN quality per epoch.
    Train {
        /// Path to train config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override optimizer steps per epoch.
        #[arg(long)]
        steps_per_epoch: Option<usize>,
        /// Override triplets per step.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the initial learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Seed for shuffling, sampling, validation queries and model init.
        #[arg(long)]
        seed: Option<u64>,
        /// Directory with the four MNIST IDX files (instead of the download).
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Keep at most this many training images.
        #[arg(long)]
        max_train: Option<usize>,
        /// Keep at most this many held-out images.
        #[arg(long)]
        max_held_out: Option<usize>,
        /// Write held-out (label, embedding) rows to this Parquet file.
        #[arg(long)]
        export_embeddings: Option<PathBuf>,
        /// Write per-epoch metrics to this JSON file.
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Draw one batch of triplets and print their indices and labels.
    Sample {
        /// Path to train config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
        /// Number of triplets to draw.
        #[arg(long, default_value_t = 8)]
        triplets: usize,
        /// Seed for shuffling and sampling.
        #[arg(long)]
        seed: Option<u64>,
        /// Directory with the four MNIST IDX files (instead of the download).
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Keep at most this many training images.
        #[arg(long)]
        max_train: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            epochs,
            steps_per_epoch,
            batch_size,
            lr,
            seed,
            data_dir,
            max_train,
            max_held_out,
            export_embeddings,
            history,
        } => pipeline::run_train(TrainArgs {
            config,
            training: TrainingCliOverrides {
                epochs,
                steps_per_epoch,
                batch_size,
                lr,
                seed,
            },
            data: DataCliOverrides {
                data_dir,
                max_train,
                max_held_out,
            },
            export_embeddings,
            history,
        }),
        Command::Sample {
            config,
            triplets,
            seed,
            data_dir,
            max_train,
        } => pipeline::run_sample(SampleArgs {
            config,
            triplets,
            seed,
            data: DataCliOverrides {
                data_dir,
                max_train,
                max_held_out: None,
            },
        }),
    }
}
