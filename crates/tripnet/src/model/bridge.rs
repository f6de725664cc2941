//! Tensor bridge: conversions between pool data (`Image`, `Label`,
//! `Vec<f32>` rows) and burn tensors.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::dataset::{Label, Pool};

/// Stack the images at `indices` into a `(n, 1, height, width)` tensor.
///
/// # Panics
/// Panics if `indices` is empty or an index is out of range.
pub fn images_to_tensor<B: Backend>(
    pool: &Pool,
    indices: &[usize],
    device: &B::Device,
) -> Tensor<B, 4> {
    assert!(!indices.is_empty(), "indices must not be empty");
    let (height, width) = pool.image_shape();
    let mut flat = Vec::with_capacity(indices.len() * height * width);
    for &i in indices {
        flat.extend_from_slice(pool.image(i).pixels());
    }
    Tensor::from_data(
        TensorData::new(flat, [indices.len(), 1, height, width]),
        device,
    )
}

/// Convert labels into an Int tensor of shape `(n,)` for cross-entropy.
pub fn labels_to_tensor<B: Backend>(labels: &[Label], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    Tensor::from_data(TensorData::new(data, [labels.len()]), device)
}

/// Convert equal-length rows into a `(rows, dim)` tensor.
///
/// # Panics
/// Panics if `rows` is empty or lengths are inconsistent.
pub fn rows_to_tensor<B: Backend>(rows: &[Vec<f32>], device: &B::Device) -> Tensor<B, 2> {
    assert!(!rows.is_empty(), "rows must not be empty");
    let dim = rows[0].len();
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), dim, "row {i} has length {}, expected {dim}", row.len());
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flat, [rows.len(), dim]), device)
}

/// Split a `(rows, dim)` tensor into one `Vec<f32>` per row.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Vec<Vec<f32>> {
    let [_, dim] = tensor.dims();
    let flat: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .unwrap_or_default();
    if dim == 0 {
        return Vec::new();
    }
    flat.chunks(dim).map(<[f32]>::to_vec).collect()
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::make_pool;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_images_to_tensor_shape_and_order() {
        let device = Default::default();
        let pool = make_pool(&[0, 1], 2);

        let tensor = images_to_tensor::<TestBackend>(&pool, &[3, 0], &device);
        assert_eq!(tensor.dims(), [2, 1, 6, 6]);

        let first: f32 = tensor
            .clone()
            .slice([0..1, 0..1, 0..1, 0..1])
            .reshape([1])
            .into_scalar()
            .elem();
        assert!((first - pool.image(3).pixels()[0]).abs() < 1e-6);

        let second: f32 = tensor
            .slice([1..2, 0..1, 0..1, 0..1])
            .reshape([1])
            .into_scalar()
            .elem();
        assert!((second - pool.image(0).pixels()[0]).abs() < 1e-6);
    }

    #[test]
    fn test_labels_to_tensor() {
        let device = Default::default();
        let t = labels_to_tensor::<TestBackend>(&[3, 0, 9], &device);
        assert_eq!(t.dims(), [3]);
        let values: Vec<i64> = t.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(values, vec![3, 0, 9]);
    }

    #[test]
    fn test_rows_round_trip() {
        let device = Default::default();
        let rows = vec![vec![1.0_f32, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let tensor = rows_to_tensor::<TestBackend>(&rows, &device);
        assert_eq!(tensor.dims(), [2, 3]);
        assert_eq!(tensor_to_rows(tensor), rows);
    }

    #[test]
    fn test_tensor_to_f64() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_data(TensorData::from([42.5_f32]), &device);
        assert!((tensor_to_f64(t) - 42.5).abs() < 1e-6);
    }
}
