use std::path::PathBuf;
use thiserror::Error;

/// Descriptor variants (binary ORB, floating SIFT) and the trait the
/// clustering code is generic over.
pub mod desc;
pub use desc::{Descriptor, DescriptorKind, OrbDesc, SiftDesc};

/// Vocabulary, weighting and pipeline configuration.
pub mod config;
pub use config::{PipelineConfig, ScoringType, VocabularyConfig, WeightingType};

/// Discovery of the training images.
pub mod corpus;
pub use corpus::Corpus;

/// Keypoint descriptor extraction backends.
pub mod extract;
pub use extract::{DescriptorExtractor, DescriptorMatrix, OrbExtractor, SiftExtractor};

/// Utilities for extracting keypoint descriptors using opencv.
#[cfg(feature = "opencv")]
pub mod opencv_utils;
#[cfg(feature = "opencv")]
pub use opencv_utils::*;

/// Reshaping of per-image descriptor matrices into the builder's input.
pub mod aggregate;
pub use aggregate::{CorpusDescriptorSet, ImageDescriptorSet};

/// Bag-of-words vectors and similarity scoring.
pub mod bow;
pub use bow::{BoW, BoWTrait, DirectIdx, WordId};

/// Implementation of a visual bag-of-words vocabulary,
/// which provides the main functionality of this crate.
pub mod vocab;
pub use vocab::{HierarchicalKMeans, Report, Vocabulary, VocabularyBuilder};
#[cfg(feature = "bincode")]
pub use vocab::peek_kind;

/// Scan -> extract -> aggregate -> build -> store orchestration.
pub mod pipeline;
pub use pipeline::{vocabulary_path, Pipeline, Progress};

/// Shared plumbing for the command line tools.
pub mod cli;

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Path error at {}: {reason}", path.display())]
    Path { path: PathBuf, reason: String },
    #[error("Cannot decode image {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
    #[error("Malformed vocabulary artifact: {0}")]
    Format(String),
    #[error("Descriptor mismatch: expected {expected}, found {found}")]
    ConfigMismatch { expected: String, found: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Device error: {0}")]
    Device(String),
    #[error("Corpus contains no descriptors")]
    EmptyCorpus,
    #[error("Only {found} descriptors extracted from {images} images, at least {required} required")]
    InsufficientDescriptors {
        found: usize,
        required: usize,
        images: usize,
    },
    #[error("Configuration file error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[cfg(feature = "bincode")]
    #[error("Vocabulary Serialization Error: {0}")]
    Bincode(#[from] bincode::Error),
    #[cfg(feature = "opencv")]
    #[error("Opencv Error: {0}")]
    OpenCvInternal(#[from] opencv::Error),
}
