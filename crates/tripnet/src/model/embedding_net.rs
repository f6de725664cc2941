use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::error::TripletError;

/// Smallest value the squared norm is clamped to before normalization.
const NORM_EPS: f64 = 1e-12;

/// Configuration for the convolutional embedding network.
///
/// LeNet-style encoder with two heads sharing one trunk:
///
/// ```text
/// (batch, 1, S, S)
///   → Conv2d(1→c1, 3x3) → ReLU
///   → Conv2d(c1→c2, 3x3) → ReLU
///   → MaxPool(2x2, stride 2) → Dropout(conv_dropout)
///   → flatten → Linear(→d_hidden) → ReLU → Dropout(dense_dropout)
///   ├→ Linear(d_hidden→embedding_dim) → L2 normalize → embeddings
///   └→ Linear(d_hidden→num_classes)                  → logits
/// ```
#[derive(Config, Debug)]
pub struct EmbeddingNetConfig {
    /// Length of the embedding vector.
    #[config(default = 64)]
    pub embedding_dim: usize,
    /// Number of classes predicted by the classification head.
    #[config(default = 10)]
    pub num_classes: usize,
    /// Side length of the square input images.
    #[config(default = 28)]
    pub image_size: usize,
    /// Output channels of the first convolution.
    #[config(default = 32)]
    pub conv1_channels: usize,
    /// Output channels of the second convolution.
    #[config(default = 64)]
    pub conv2_channels: usize,
    /// Width of the shared dense layer.
    #[config(default = 512)]
    pub d_hidden: usize,
    /// Dropout after pooling.
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    /// Dropout after the shared dense layer.
    #[config(default = 0.5)]
    pub dense_dropout: f64,
}

/// Outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct EmbeddingOutput<B: Backend> {
    /// Unit-norm embeddings, shape `(batch, embedding_dim)`.
    pub embeddings: Tensor<B, 2>,
    /// Unnormalized class scores, shape `(batch, num_classes)`.
    pub logits: Tensor<B, 2>,
}

/// Convolutional image encoder with an embedding head and a classification head.
#[derive(Module, Debug)]
pub struct EmbeddingNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    dropout1: Dropout,
    dense: Linear<B>,
    dropout2: Dropout,
    /// Embedding head: d_hidden → embedding_dim.
    pub(crate) embed: Linear<B>,
    /// Classification head: d_hidden → num_classes.
    pub(crate) classifier: Linear<B>,
}

impl EmbeddingNetConfig {
    /// Spatial side length after the two valid 3x3 convolutions and 2x2 pooling.
    pub fn pooled_size(&self) -> usize {
        self.image_size.saturating_sub(4) / 2
    }

    /// Number of features entering the shared dense layer.
    pub fn flattened_dim(&self) -> usize {
        self.conv2_channels * self.pooled_size() * self.pooled_size()
    }

    /// Check that the configured sizes produce a non-empty network.
    pub fn validate(&self) -> Result<(), TripletError> {
        if self.image_size < 6 {
            return Err(TripletError::InvalidConfig(format!(
                "image_size must be at least 6, got {}",
                self.image_size
            )));
        }
        if self.embedding_dim == 0 || self.num_classes == 0 {
            return Err(TripletError::InvalidConfig(
                "embedding_dim and num_classes must be positive".to_string(),
            ));
        }
        if self.conv1_channels == 0 || self.conv2_channels == 0 || self.d_hidden == 0 {
            return Err(TripletError::InvalidConfig(
                "layer widths must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Initialize an EmbeddingNet with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmbeddingNet<B> {
        EmbeddingNet {
            conv1: Conv2dConfig::new([1, self.conv1_channels], [3, 3]).init(device),
            conv2: Conv2dConfig::new([self.conv1_channels, self.conv2_channels], [3, 3])
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout1: DropoutConfig::new(self.conv_dropout).init(),
            dense: LinearConfig::new(self.flattened_dim(), self.d_hidden).init(device),
            dropout2: DropoutConfig::new(self.dense_dropout).init(),
            embed: LinearConfig::new(self.d_hidden, self.embedding_dim).init(device),
            classifier: LinearConfig::new(self.d_hidden, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> EmbeddingNet<B> {
    /// Forward pass over a batch of images.
    ///
    /// Input shape: `(batch, 1, image_size, image_size)`
    pub fn forward(&self, images: Tensor<B, 4>) -> EmbeddingOutput<B> {
        let x = relu(self.conv1.forward(images));
        let x = relu(self.conv2.forward(x));
        let x = self.pool.forward(x);
        let x = self.dropout1.forward(x);

        let x: Tensor<B, 2> = x.flatten(1, 3);
        let x = relu(self.dense.forward(x));
        let x = self.dropout2.forward(x);

        let embeddings = l2_normalize(self.embed.forward(x.clone()));
        let logits = self.classifier.forward(x);
        EmbeddingOutput { embeddings, logits }
    }

    /// Unit-norm embeddings only.
    pub fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images).embeddings
    }

    pub fn embedding_dim(&self) -> usize {
        self.embed.weight.dims()[1]
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.weight.dims()[1]
    }
}

/// Row-wise L2 normalization: `x / sqrt(max(sum(x²), eps))`.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .clamp_min(NORM_EPS)
        .sqrt();
    x / norm
}
