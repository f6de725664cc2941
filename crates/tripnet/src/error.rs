use crate::dataset::Label;

/// Errors raised by pool validation, sampling, and training.
#[derive(Debug, thiserror::Error)]
pub enum TripletError {
    /// A pool was built from zero samples.
    #[error("Pool is empty")]
    EmptyPool,

    /// An image does not match the shape of the first image in the pool.
    #[error("Image {index} has shape {found:?}, expected {expected:?}")]
    ImageShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// Triplets need an anchor class and a distinct negative class.
    #[error("Pool has {found} class(es), at least 2 are required for triplet sampling")]
    TooFewClasses { found: usize },

    /// A class cannot supply a distinct anchor/positive pair.
    #[error("Class {label} has {count} sample(s), at least {required} required")]
    ClassTooSmall {
        label: Label,
        count: usize,
        required: usize,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The training loss left the finite range.
    #[error("Loss became non-finite ({value}) at step {step}")]
    NonFiniteLoss { step: usize, value: f64 },

    /// Malformed dataset contents.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// IO error while reading dataset files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
