use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

use crate::{BowErr, BowResult, DescriptorKind};

/// How the weight of a visual word is computed.
///
/// Numeric codes follow the DBoW2 text format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WeightingType {
    TfIdf,
    Tf,
    Idf,
    Binary,
}

/// Similarity measure between two bag-of-words vectors.
///
/// Numeric codes follow the DBoW2 text format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringType {
    L1Norm,
    L2Norm,
    ChiSquare,
    Kl,
    Bhattacharyya,
    DotProduct,
}

impl WeightingType {
    pub fn code(self) -> u8 {
        match self {
            WeightingType::TfIdf => 0,
            WeightingType::Tf => 1,
            WeightingType::Idf => 2,
            WeightingType::Binary => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WeightingType::TfIdf),
            1 => Some(WeightingType::Tf),
            2 => Some(WeightingType::Idf),
            3 => Some(WeightingType::Binary),
            _ => None,
        }
    }

    /// Whether leaf weights carry inverse document frequency.
    pub fn uses_idf(self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Idf)
    }

    /// Whether repeated words accumulate (term frequency) in a BoW vector.
    pub fn uses_tf(self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Tf)
    }
}

impl ScoringType {
    pub fn code(self) -> u8 {
        match self {
            ScoringType::L1Norm => 0,
            ScoringType::L2Norm => 1,
            ScoringType::ChiSquare => 2,
            ScoringType::Kl => 3,
            ScoringType::Bhattacharyya => 4,
            ScoringType::DotProduct => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ScoringType::L1Norm),
            1 => Some(ScoringType::L2Norm),
            2 => Some(ScoringType::ChiSquare),
            3 => Some(ScoringType::Kl),
            4 => Some(ScoringType::Bhattacharyya),
            5 => Some(ScoringType::DotProduct),
            _ => None,
        }
    }
}

impl fmt::Display for WeightingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WeightingType::TfIdf => "tf-idf",
            WeightingType::Tf => "tf",
            WeightingType::Idf => "idf",
            WeightingType::Binary => "binary",
        })
    }
}

impl fmt::Display for ScoringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScoringType::L1Norm => "L1-norm",
            ScoringType::L2Norm => "L2-norm",
            ScoringType::ChiSquare => "Chi square distance",
            ScoringType::Kl => "KL-divergence",
            ScoringType::Bhattacharyya => "Bhattacharyya coefficient",
            ScoringType::DotProduct => "Dot product",
        })
    }
}

impl FromStr for WeightingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "tf-idf" | "tfidf" => Ok(WeightingType::TfIdf),
            "tf" => Ok(WeightingType::Tf),
            "idf" => Ok(WeightingType::Idf),
            "binary" => Ok(WeightingType::Binary),
            other => Err(format!("unknown weighting '{}'", other)),
        }
    }
}

impl FromStr for ScoringType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "l1" | "l1-norm" => Ok(ScoringType::L1Norm),
            "l2" | "l2-norm" => Ok(ScoringType::L2Norm),
            "chi-square" | "chi2" => Ok(ScoringType::ChiSquare),
            "kl" => Ok(ScoringType::Kl),
            "bhattacharyya" => Ok(ScoringType::Bhattacharyya),
            "dot-product" | "dot" => Ok(ScoringType::DotProduct),
            other => Err(format!("unknown scoring '{}'", other)),
        }
    }
}

/// Shape and weighting of a vocabulary tree.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabularyConfig {
    /// Branching factor.
    pub k: usize,
    /// Maximum number of levels below the root.
    pub l: usize,
    pub weighting: WeightingType,
    pub scoring: ScoringType,
}

impl VocabularyConfig {
    pub fn new(k: usize, l: usize, weighting: WeightingType, scoring: ScoringType) -> Self {
        Self {
            k,
            l,
            weighting,
            scoring,
        }
    }

    /// Defaults used for each descriptor family: 10^6 words, TF-IDF,
    /// L1 scoring for ORB and L2 scoring for SIFT.
    pub fn default_for(kind: DescriptorKind) -> Self {
        let scoring = match kind {
            DescriptorKind::Orb => ScoringType::L1Norm,
            DescriptorKind::Sift => ScoringType::L2Norm,
        };
        Self::new(10, 6, WeightingType::TfIdf, scoring)
    }

    pub fn validate(&self) -> BowResult<()> {
        if self.k < 2 {
            return Err(BowErr::InvalidConfig(format!(
                "branching factor must be at least 2, got {}",
                self.k
            )));
        }
        if self.l < 1 {
            return Err(BowErr::InvalidConfig(format!(
                "depth must be at least 1, got {}",
                self.l
            )));
        }
        Ok(())
    }

    /// Upper bound on the number of words, `None` if it overflows `usize`.
    pub fn max_words(&self) -> Option<usize> {
        self.k.checked_pow(self.l as u32)
    }
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self::default_for(DescriptorKind::Orb)
    }
}

/// Corpus discovery settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    /// Accepted file extensions, compared case-insensitively, without the dot.
    pub extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["png".to_string()],
        }
    }
}

/// CPU ORB extractor settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OrbConfig {
    /// Maximum number of features kept per image.
    pub max_features: usize,
    /// FAST intensity threshold.
    pub fast_threshold: u8,
    /// Number of pyramid levels.
    pub n_levels: usize,
    /// Downscale factor between consecutive pyramid levels.
    pub scale_factor: f32,
    /// Side of the (odd sized) patch used for orientation and BRIEF sampling.
    pub patch_size: usize,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            n_levels: 8,
            scale_factor: 1.2,
            patch_size: 31,
        }
    }
}

/// Scale-space SIFT extraction parameters handed to the device kernels.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SiftParams {
    pub octaves: u32,
    /// Blur already present in the input image.
    pub init_blur: f32,
    /// Minimum absolute difference-of-gaussians response (grey levels).
    pub threshold: f32,
    pub lowest_scale: f32,
    /// Double the image before building the scale space.
    pub upscale: bool,
    /// Capacity of the point buffer downloaded per image.
    pub max_points: usize,
}

impl Default for SiftParams {
    fn default() -> Self {
        Self {
            octaves: 5,
            init_blur: 1.0,
            threshold: 1.5,
            lowest_scale: 0.0,
            upscale: true,
            max_points: 2000,
        }
    }
}

/// Hierarchical k-means settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Seed for k-means++ initialization. Fixed so reruns are reproducible.
    pub seed: u64,
    /// Lloyd iterations per k-means step.
    pub max_iterations: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed_ab0f,
            max_iterations: 100,
        }
    }
}

/// Everything a vocabulary build needs, loadable from a TOML file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub descriptor: DescriptorKind,
    pub scan: ScanConfig,
    pub orb: OrbConfig,
    pub sift: SiftParams,
    pub clustering: ClusteringConfig,
    /// Overrides the per-descriptor default vocabulary shape.
    pub vocabulary: Option<VocabularyConfig>,
    /// A build producing fewer descriptors than this is reported as an error.
    pub min_descriptors: usize,
    /// Extraction worker threads. 1 keeps extraction sequential.
    pub jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            descriptor: DescriptorKind::Orb,
            scan: ScanConfig::default(),
            orb: OrbConfig::default(),
            sift: SiftParams::default(),
            clustering: ClusteringConfig::default(),
            vocabulary: None,
            min_descriptors: 1000,
            jobs: 1,
        }
    }
}

impl PipelineConfig {
    pub fn vocabulary_config(&self) -> VocabularyConfig {
        self.vocabulary
            .unwrap_or_else(|| VocabularyConfig::default_for(self.descriptor))
    }

    pub fn from_toml(toml_str: &str) -> BowResult<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn load_toml<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| BowErr::Path {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> BowResult<()> {
        self.vocabulary_config().validate()?;
        if self.orb.patch_size % 2 == 0 || self.orb.patch_size < 7 {
            return Err(BowErr::InvalidConfig(format!(
                "ORB patch size must be odd and at least 7, got {}",
                self.orb.patch_size
            )));
        }
        if self.orb.scale_factor <= 1.0 {
            return Err(BowErr::InvalidConfig(format!(
                "ORB scale factor must be greater than 1, got {}",
                self.orb.scale_factor
            )));
        }
        if self.sift.octaves == 0 || self.sift.max_points == 0 {
            return Err(BowErr::InvalidConfig(
                "SIFT needs at least one octave and a non-empty point buffer".to_string(),
            ));
        }
        Ok(())
    }
}
