//! Triplet margin loss and classification loss.
//!
//! Both loss functions are generic over `B: Backend` and operate on burn tensors.
//! The triplet loss expects the `[N anchors][N positives][N negatives]` row
//! layout produced by the batch assembler.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Triplet margin loss over a stacked batch of embeddings.
///
/// `mean_i max(0, ||a_i - p_i||² - ||a_i - n_i||² + margin)`
///
/// # Arguments
/// - `embeddings`: shape `(3N, dim)`, anchors, then positives, then negatives
/// - `num_triplets`: N
/// - `margin`: required gap between negative and positive squared distances
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`.
///
/// # Panics
/// Panics if the row count is not `3 * num_triplets`.
pub fn triplet_loss<B: Backend>(
    embeddings: Tensor<B, 2>,
    num_triplets: usize,
    margin: f64,
) -> Tensor<B, 1> {
    let [rows, dim] = embeddings.dims();
    assert_eq!(
        rows,
        3 * num_triplets,
        "expected {} rows for {num_triplets} triplets, got {rows}",
        3 * num_triplets
    );
    let n = num_triplets;

    let anchors = embeddings.clone().slice([0..n, 0..dim]);
    let positives = embeddings.clone().slice([n..2 * n, 0..dim]);
    let negatives = embeddings.slice([2 * n..3 * n, 0..dim]);

    let d_pos = (anchors.clone() - positives).powf_scalar(2.0).sum_dim(1); // (N, 1)
    let d_neg = (anchors - negatives).powf_scalar(2.0).sum_dim(1); // (N, 1)

    relu(d_pos - d_neg + margin).mean()
}

/// Cross-entropy between class logits `(batch, classes)` and labels `(batch,)`.
pub fn classification_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let device = logits.device();
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_triplet_loss_satisfied_margin_is_zero() {
        let device = Default::default();
        // anchor == positive, negative far away
        let emb = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 0.0], [1.0, 0.0], [-1.0, 0.0]]),
            &device,
        );
        let loss: f32 = triplet_loss(emb, 1, 0.2).into_scalar().elem();
        assert!(loss.abs() < 1e-6, "Satisfied margin should give zero loss, got {loss}");
    }

    #[test]
    fn test_triplet_loss_violated_margin() {
        let device = Default::default();
        // d_pos = 4, d_neg = 0 → loss = 4 + 0.5
        let emb = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 0.0], [-1.0, 0.0], [1.0, 0.0]]),
            &device,
        );
        let loss: f32 = triplet_loss(emb, 1, 0.5).into_scalar().elem();
        assert!((loss - 4.5).abs() < 1e-5, "Expected 4.5, got {loss}");
    }

    #[test]
    fn test_triplet_loss_averages_over_triplets() {
        let device = Default::default();
        // Triplet 0: zero loss. Triplet 1: d_pos=1, d_neg=0 → 1 + 0.
        let emb = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([
                [0.0_f32, 0.0], // a0
                [0.0, 0.0],     // a1
                [0.0, 0.0],     // p0
                [1.0, 0.0],     // p1
                [5.0, 0.0],     // n0
                [0.0, 0.0],     // n1
            ]),
            &device,
        );
        let loss: f32 = triplet_loss(emb, 2, 0.0).into_scalar().elem();
        assert!((loss - 0.5).abs() < 1e-6, "Expected mean 0.5, got {loss}");
    }

    #[test]
    #[should_panic(expected = "expected 6 rows")]
    fn test_triplet_loss_row_mismatch_panics() {
        let device = Default::default();
        let emb = Tensor::<TestBackend, 2>::zeros([5, 2], &device);
        let _ = triplet_loss(emb, 2, 0.2);
    }

    #[test]
    fn test_triplet_loss_gradient_direction() {
        let device = Default::default();
        let emb = Tensor::<TestAutodiffBackend, 2>::from_data(
            TensorData::from([[0.0_f32, 0.0], [1.0, 0.0], [0.5, 0.0]]),
            &device,
        )
        .require_grad();

        let loss = triplet_loss(emb.clone(), 1, 0.2);
        let grads = loss.backward();
        let g: Vec<f32> = emb.grad(&grads).unwrap().into_data().to_vec().unwrap();

        // loss = (a-p)² - (a-n)² + m: dL/dp = -2(a-p) = 2 → descent pulls p toward a.
        assert!(g[2] > 0.0, "positive should be pulled toward anchor, grad={}", g[2]);
        // dL/dn = 2(a-n) = -1 → descent pushes n away from a.
        assert!(g[4] < 0.0, "negative should be pushed away, grad={}", g[4]);
    }

    #[test]
    fn test_classification_loss_confident_correct() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[10.0_f32, -10.0], [-10.0, 10.0]]),
            &device,
        );
        let labels =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 1]), &device);
        let loss: f32 = classification_loss(logits, labels).into_scalar().elem();
        assert!(loss < 0.01, "Confident correct predictions should be near zero, got {loss}");
    }

    #[test]
    fn test_classification_loss_uniform_logits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([3, 4], &device);
        let labels =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 2, 3]), &device);
        let loss: f32 = classification_loss(logits, labels).into_scalar().elem();
        let expected = (4.0_f32).ln();
        assert!((loss - expected).abs() < 1e-4, "Expected ln(4), got {loss}");
    }
}
