//! Labeled image pools and dataset loading.
//!
//! A [`Pool`] is an ordered, immutable collection of `(Image, Label)` samples
//! with a per-class index for fast triplet sampling. Pools are built once at
//! start-up (optionally shuffled and truncated while building) and are only
//! shared by reference afterwards.
//!
//! Two loaders are provided:
//! - [`DatasetSource::Mnist`]: burn's vision `MnistDataset` (downloads on first use)
//! - [`DatasetSource::Idx`]: a local directory holding the four standard IDX files

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::error::TripletError;

/// Integer class identifier.
pub type Label = u8;

/// Pixel scale applied to raw 8-bit intensities.
const PIXEL_SCALE: f32 = 1.0 / 255.0;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// A fixed-size grayscale image stored row-major, intensities in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    height: usize,
    width: usize,
    pixels: Vec<f32>,
}

impl Image {
    /// Build an image from row-major pixels.
    ///
    /// # Errors
    /// Returns [`TripletError::Dataset`] if `pixels.len() != height * width`.
    pub fn new(height: usize, width: usize, pixels: Vec<f32>) -> Result<Self, TripletError> {
        if pixels.len() != height * width {
            return Err(TripletError::Dataset(format!(
                "image has {} pixels, expected {height}x{width}",
                pixels.len()
            )));
        }
        Ok(Self {
            height,
            width,
            pixels,
        })
    }

    /// Build an image from raw 8-bit intensities, scaling them into `[0, 1]`.
    pub fn from_bytes(height: usize, width: usize, bytes: &[u8]) -> Result<Self, TripletError> {
        let pixels = bytes.iter().map(|&b| b as f32 * PIXEL_SCALE).collect();
        Self::new(height, width, pixels)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }
}

/// One labeled example.
#[derive(Clone, Debug)]
pub struct Sample {
    pub image: Image,
    pub label: Label,
}

/// Ordered collection of labeled samples with a per-class index.
///
/// Invariants: non-empty, every image shares one shape, and `by_class`
/// lists each sample index exactly once under its label.
#[derive(Clone, Debug)]
pub struct Pool {
    samples: Vec<Sample>,
    by_class: BTreeMap<Label, Vec<usize>>,
    image_shape: (usize, usize),
}

impl Pool {
    /// Build a pool, validating that it is non-empty and shape-consistent.
    pub fn new(samples: Vec<Sample>) -> Result<Self, TripletError> {
        let first = samples.first().ok_or(TripletError::EmptyPool)?;
        let image_shape = first.image.shape();

        for (index, sample) in samples.iter().enumerate() {
            let found = sample.image.shape();
            if found != image_shape {
                return Err(TripletError::ImageShapeMismatch {
                    index,
                    expected: image_shape,
                    found,
                });
            }
        }

        let by_class = build_class_index(&samples);
        Ok(Self {
            samples,
            by_class,
            image_shape,
        })
    }

    /// Shuffle the sample order once and rebuild the class index.
    pub fn shuffled(mut self, rng: &mut impl Rng) -> Self {
        self.samples.shuffle(rng);
        self.by_class = build_class_index(&self.samples);
        self
    }

    /// Keep at most the first `max` samples.
    pub fn truncated(mut self, max: usize) -> Result<Self, TripletError> {
        if max == 0 {
            return Err(TripletError::EmptyPool);
        }
        if max < self.samples.len() {
            self.samples.truncate(max);
            self.by_class = build_class_index(&self.samples);
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> &Sample {
        &self.samples[index]
    }

    pub fn image(&self, index: usize) -> &Image {
        &self.samples[index].image
    }

    pub fn label(&self, index: usize) -> Label {
        self.samples[index].label
    }

    /// Labels of all samples, in pool order.
    pub fn labels(&self) -> Vec<Label> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// Distinct labels present in the pool, ascending.
    pub fn classes(&self) -> Vec<Label> {
        self.by_class.keys().copied().collect()
    }

    pub fn num_classes(&self) -> usize {
        self.by_class.len()
    }

    /// Sample indices carrying `label` (empty if the label is absent).
    pub fn class_indices(&self, label: Label) -> &[usize] {
        self.by_class.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Per-class sample counts, ascending by label.
    pub fn class_counts(&self) -> Vec<(Label, usize)> {
        self.by_class.iter().map(|(&l, v)| (l, v.len())).collect()
    }

    /// `(height, width)` shared by every image.
    pub fn image_shape(&self) -> (usize, usize) {
        self.image_shape
    }
}

fn build_class_index(samples: &[Sample]) -> BTreeMap<Label, Vec<usize>> {
    let mut by_class: BTreeMap<Label, Vec<usize>> = BTreeMap::new();
    for (i, sample) in samples.iter().enumerate() {
        by_class.entry(sample.label).or_default().push(i);
    }
    by_class
}

/// Where the labeled images come from.
///
/// # Example (TOML)
///
/// ```toml
/// [data.source]
/// type = "Idx"
/// dir = "data/mnist"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type")]
pub enum DatasetSource {
    /// burn's vision MNIST dataset, downloaded and cached by burn.
    #[default]
    Mnist,
    /// Directory containing `train-images-idx3-ubyte`, `train-labels-idx1-ubyte`,
    /// `t10k-images-idx3-ubyte` and `t10k-labels-idx1-ubyte`.
    Idx { dir: PathBuf },
}

/// Training pool and held-out validation pool.
#[derive(Clone, Debug)]
pub struct SplitPools {
    pub train: Pool,
    pub held_out: Pool,
}

/// Load both pools from `source` and shuffle each one once.
///
/// # Errors
/// Any loader failure is fatal for the run and is returned with context.
pub fn load_dataset(source: &DatasetSource, rng: &mut impl Rng) -> anyhow::Result<SplitPools> {
    let (train, held_out) = match source {
        DatasetSource::Mnist => load_mnist()?,
        DatasetSource::Idx { dir } => load_idx_dir(dir)?,
    };

    let train = Pool::new(train)
        .map_err(|e| anyhow::anyhow!("Invalid training pool: {e}"))?
        .shuffled(rng);
    let held_out = Pool::new(held_out)
        .map_err(|e| anyhow::anyhow!("Invalid held-out pool: {e}"))?
        .shuffled(rng);

    tracing::info!(
        train = train.len(),
        held_out = held_out.len(),
        classes = train.num_classes(),
        height = train.image_shape().0,
        width = train.image_shape().1,
        "Dataset loaded"
    );

    Ok(SplitPools { train, held_out })
}

/// Load MNIST through burn's vision dataset.
fn load_mnist() -> anyhow::Result<(Vec<Sample>, Vec<Sample>)> {
    use burn::data::dataset::vision::{MnistDataset, MnistItem};
    use burn::data::dataset::Dataset;

    fn convert(item: MnistItem) -> Result<Sample, TripletError> {
        let height = item.image.len();
        let width = item.image.first().map(|row| row.len()).unwrap_or(0);
        let pixels = item
            .image
            .iter()
            .flat_map(|row| row.iter().map(|&v| v * PIXEL_SCALE))
            .collect();
        Ok(Sample {
            image: Image::new(height, width, pixels)?,
            label: item.label,
        })
    }

    tracing::info!("Loading MNIST via burn vision dataset");
    let train = MnistDataset::train()
        .iter()
        .map(convert)
        .collect::<Result<Vec<_>, _>>()?;
    let test = MnistDataset::test()
        .iter()
        .map(convert)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((train, test))
}

/// Load the four standard MNIST IDX files from `dir`.
pub fn load_idx_dir(dir: &Path) -> anyhow::Result<(Vec<Sample>, Vec<Sample>)> {
    let train = load_idx_pair(
        &dir.join("train-images-idx3-ubyte"),
        &dir.join("train-labels-idx1-ubyte"),
    )?;
    let test = load_idx_pair(
        &dir.join("t10k-images-idx3-ubyte"),
        &dir.join("t10k-labels-idx1-ubyte"),
    )?;
    tracing::info!(dir = %dir.display(), train = train.len(), test = test.len(), "Loaded IDX files");
    Ok((train, test))
}

fn load_idx_pair(images_path: &Path, labels_path: &Path) -> anyhow::Result<Vec<Sample>> {
    let images = read_idx_images(images_path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", images_path.display()))?;
    let labels = read_idx_labels(labels_path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", labels_path.display()))?;
    if images.len() != labels.len() {
        anyhow::bail!(
            "{} holds {} images but {} holds {} labels",
            images_path.display(),
            images.len(),
            labels_path.display(),
            labels.len()
        );
    }
    Ok(images
        .into_iter()
        .zip(labels)
        .map(|(image, label)| Sample { image, label })
        .collect())
}

fn read_u32_be(reader: &mut impl Read) -> Result<u32, TripletError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

const IDX_IMAGES_HEADER: u64 = 16;
const IDX_LABELS_HEADER: u64 = 8;

/// Compare the payload the header declares against the bytes on disk.
fn check_idx_payload(
    path: &Path,
    header: u64,
    count: usize,
    item_bytes: usize,
) -> Result<(), TripletError> {
    let claimed = count
        .checked_mul(item_bytes)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| {
            TripletError::Dataset(format!(
                "header claims {count} items of {item_bytes} bytes, which overflows"
            ))
        })?;
    let actual = std::fs::metadata(path)?.len().saturating_sub(header);
    if claimed != actual {
        return Err(TripletError::Dataset(format!(
            "header claims {claimed} bytes, file has {actual}"
        )));
    }
    Ok(())
}

/// Read an IDX3 image file (magic `0x00000803`).
pub fn read_idx_images(path: &Path) -> Result<Vec<Image>, TripletError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let magic = read_u32_be(&mut reader)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(TripletError::Dataset(format!(
            "bad image magic {magic:#010x}"
        )));
    }
    let count = read_u32_be(&mut reader)? as usize;
    let height = read_u32_be(&mut reader)? as usize;
    let width = read_u32_be(&mut reader)? as usize;
    let pixels = height
        .checked_mul(width)
        .ok_or_else(|| TripletError::Dataset(format!("image size {height}x{width} overflows")))?;
    check_idx_payload(path, IDX_IMAGES_HEADER, count, pixels)?;

    let mut buf = vec![0u8; height * width];
    let mut images = Vec::with_capacity(count);
    for _ in 0..count {
        reader.read_exact(&mut buf)?;
        images.push(Image::from_bytes(height, width, &buf)?);
    }
    Ok(images)
}

/// Read an IDX1 label file (magic `0x00000801`).
pub fn read_idx_labels(path: &Path) -> Result<Vec<Label>, TripletError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let magic = read_u32_be(&mut reader)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(TripletError::Dataset(format!(
            "bad label magic {magic:#010x}"
        )));
    }
    let count = read_u32_be(&mut reader)? as usize;
    check_idx_payload(path, IDX_LABELS_HEADER, count, 1)?;
    let mut labels = vec![0u8; count];
    reader.read_exact(&mut labels)?;
    Ok(labels)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Pool of `per_class` constant-valued 6x6 images for each label in `labels`.
    pub(crate) fn make_pool(labels: &[Label], per_class: usize) -> Pool {
        let mut samples = Vec::new();
        for &label in labels {
            for i in 0..per_class {
                let value = (label as f32 * 10.0 + i as f32) / 255.0;
                samples.push(Sample {
                    image: Image::new(6, 6, vec![value; 36]).unwrap(),
                    label,
                });
            }
        }
        Pool::new(samples).unwrap()
    }

    fn write_idx(dir: &Path, images_name: &str, labels_name: &str, labels: &[u8]) {
        let mut images = Vec::new();
        images.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        images.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        images.extend_from_slice(&2u32.to_be_bytes());
        images.extend_from_slice(&3u32.to_be_bytes());
        for (i, _) in labels.iter().enumerate() {
            images.extend(std::iter::repeat(i as u8 * 50).take(6));
        }
        std::fs::write(dir.join(images_name), images).unwrap();

        let mut label_bytes = Vec::new();
        label_bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        label_bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        label_bytes.extend_from_slice(labels);
        std::fs::write(dir.join(labels_name), label_bytes).unwrap();
    }

    #[test]
    fn test_pool_class_index() {
        let pool = make_pool(&[3, 1, 7], 4);
        assert_eq!(pool.len(), 12);
        assert_eq!(pool.classes(), vec![1, 3, 7]);
        assert_eq!(pool.class_indices(3), &[0, 1, 2, 3]);
        assert!(pool.class_indices(9).is_empty());
        assert_eq!(pool.class_counts(), vec![(1, 4), (3, 4), (7, 4)]);
        assert_eq!(pool.image_shape(), (6, 6));
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(Pool::new(vec![]), Err(TripletError::EmptyPool)));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let samples = vec![
            Sample {
                image: Image::new(2, 2, vec![0.0; 4]).unwrap(),
                label: 0,
            },
            Sample {
                image: Image::new(3, 3, vec![0.0; 9]).unwrap(),
                label: 1,
            },
        ];
        let err = Pool::new(samples).unwrap_err();
        assert!(matches!(
            err,
            TripletError::ImageShapeMismatch { index: 1, expected: (2, 2), found: (3, 3) }
        ));
    }

    #[test]
    fn test_image_pixel_count_checked() {
        assert!(Image::new(2, 2, vec![0.0; 3]).is_err());
        let img = Image::from_bytes(1, 2, &[0, 255]).unwrap();
        assert_eq!(img.pixels(), &[0.0, 1.0]);
    }

    #[test]
    fn test_shuffle_keeps_index_consistent() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let pool = make_pool(&[0, 1, 2], 5).shuffled(&mut rng);
        assert_eq!(pool.len(), 15);
        for label in pool.classes() {
            for &i in pool.class_indices(label) {
                assert_eq!(pool.label(i), label);
            }
        }
    }

    #[test]
    fn test_truncate_rebuilds_index() {
        let pool = make_pool(&[0, 1], 3).truncated(4).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.class_counts(), vec![(0, 3), (1, 1)]);
        assert!(make_pool(&[0], 2).truncated(0).is_err());
    }

    #[test]
    fn test_load_idx_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "train-images-idx3-ubyte", "train-labels-idx1-ubyte", &[0, 1, 1]);
        write_idx(dir.path(), "t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte", &[2, 0]);

        let (train, test) = load_idx_dir(dir.path()).unwrap();
        assert_eq!(train.len(), 3);
        assert_eq!(test.len(), 2);
        assert_eq!(train[1].label, 1);
        assert_eq!(train[1].image.shape(), (2, 3));
        assert!((train[1].image.pixels()[0] - 50.0 / 255.0).abs() < 1e-6);
        assert_eq!(test[0].label, 2);
    }

    #[test]
    fn test_load_dataset_idx_source() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "train-images-idx3-ubyte", "train-labels-idx1-ubyte", &[0, 1, 1, 0]);
        write_idx(dir.path(), "t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte", &[1, 0]);

        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let source = DatasetSource::Idx {
            dir: dir.path().to_path_buf(),
        };
        let pools = load_dataset(&source, &mut rng).unwrap();
        assert_eq!(pools.train.len(), 4);
        assert_eq!(pools.held_out.len(), 2);
        assert_eq!(pools.train.num_classes(), 2);
    }

    #[test]
    fn test_missing_idx_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_idx_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("train-images-idx3-ubyte"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, [0u8, 0, 8, 1, 0, 0, 0, 0]).unwrap();
        assert!(matches!(read_idx_images(&path), Err(TripletError::Dataset(_))));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read_idx_images(&path), Err(TripletError::Dataset(_))));
    }

    #[test]
    fn test_truncated_idx_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&images, bytes).unwrap();
        let err = read_idx_images(&images).unwrap_err();
        assert!(err.to_string().contains("header claims 12 bytes, file has 8"));

        let labels = dir.path().join("labels");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[1u8, 2]);
        std::fs::write(&labels, bytes).unwrap();
        assert!(matches!(read_idx_labels(&labels), Err(TripletError::Dataset(_))));
    }

    #[test]
    fn test_deserialize_source() {
        let src: DatasetSource = toml::from_str(r#"type = "Mnist""#).unwrap();
        assert_eq!(src, DatasetSource::Mnist);
        let src: DatasetSource = toml::from_str(
            r#"
type = "Idx"
dir = "data/mnist"
"#,
        )
        .unwrap();
        assert_eq!(
            src,
            DatasetSource::Idx {
                dir: PathBuf::from("data/mnist")
            }
        );
    }
}
