use bitvec::{order::Msb0, view::BitView};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{convert::TryFrom, fmt, str::FromStr};

/// Binary descriptor produced by ORB: 256 bits, compared with Hamming distance.
pub type OrbDesc = [u8; 32];

/// Number of components in a SIFT descriptor.
pub const SIFT_LEN: usize = 128;

/// Which descriptor family a vocabulary was trained on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Orb,
    Sift,
}

impl DescriptorKind {
    /// Number of scalar components per descriptor.
    pub fn len(self) -> usize {
        match self {
            DescriptorKind::Orb => std::mem::size_of::<OrbDesc>(),
            DescriptorKind::Sift => SIFT_LEN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorKind::Orb => "orb",
            DescriptorKind::Sift => "sift",
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} components)", self.name(), self.len())
    }
}

impl FromStr for DescriptorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "orb" => Ok(DescriptorKind::Orb),
            "sift" => Ok(DescriptorKind::Sift),
            other => Err(format!("unknown descriptor type '{}' (expected orb or sift)", other)),
        }
    }
}

/// A fixed-length keypoint descriptor the vocabulary can be trained on.
///
/// Implementations provide the distance used to descend the tree, the
/// centroid ("mean") used by k-means, and a whitespace separated text form
/// used by the plain text vocabulary format.
pub trait Descriptor:
    Clone + PartialEq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Scalar type of one component (a byte or a float).
    type Component: Copy + Send + Sync + fmt::Debug + 'static;

    const KIND: DescriptorKind;
    const LEN: usize;

    /// Copy one row of a raw descriptor matrix. `None` if the row length is wrong.
    fn from_row(row: &[Self::Component]) -> Option<Self>;

    fn distance(&self, other: &Self) -> f64;

    /// Centroid of a non-empty group of descriptors.
    fn mean(descriptors: &[&Self]) -> Self;

    fn to_text(&self) -> String;

    fn from_text(fields: &[&str]) -> Option<Self>;
}

impl Descriptor for OrbDesc {
    type Component = u8;

    const KIND: DescriptorKind = DescriptorKind::Orb;
    const LEN: usize = 32;

    fn from_row(row: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(row).ok()
    }

    #[inline]
    /// Hamming distance between two binary arrays (descriptors).
    fn distance(&self, other: &Self) -> f64 {
        self.iter()
            .zip(other)
            .fold(0u32, |a, (b, c)| a + (*b ^ *c).count_ones()) as f64
    }

    /// Bitwise majority vote over the group.
    fn mean(descriptors: &[&Self]) -> Self {
        let n2 = descriptors.len() / 2;
        let mut counts = [0usize; 256];
        let mut result: OrbDesc = [0; 32];
        for d in descriptors {
            for (i, b) in d.view_bits::<Msb0>().iter().by_vals().enumerate() {
                if b {
                    counts[i] += 1;
                }
            }
        }
        let result_bits = result.view_bits_mut::<Msb0>();
        for (i, &c) in counts.iter().enumerate() {
            if c > n2 {
                result_bits.set(i, true);
            }
        }
        result
    }

    fn to_text(&self) -> String {
        self.iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn from_text(fields: &[&str]) -> Option<Self> {
        if fields.len() != Self::LEN {
            return None;
        }
        let mut d = [0u8; 32];
        for (slot, f) in d.iter_mut().zip(fields) {
            *slot = f.parse().ok()?;
        }
        Some(d)
    }
}

/// Floating point SIFT descriptor: 128 components, compared with Euclidean distance.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(into = "Vec<f32>", try_from = "Vec<f32>")]
pub struct SiftDesc(pub [f32; SIFT_LEN]);

impl SiftDesc {
    pub fn zeros() -> Self {
        SiftDesc([0.; SIFT_LEN])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl From<SiftDesc> for Vec<f32> {
    fn from(d: SiftDesc) -> Self {
        d.0.to_vec()
    }
}

impl TryFrom<Vec<f32>> for SiftDesc {
    type Error = String;

    fn try_from(v: Vec<f32>) -> Result<Self, Self::Error> {
        let len = v.len();
        <[f32; SIFT_LEN]>::try_from(v)
            .map(SiftDesc)
            .map_err(|_| format!("sift descriptor with {} components", len))
    }
}

impl Descriptor for SiftDesc {
    type Component = f32;

    const KIND: DescriptorKind = DescriptorKind::Sift;
    const LEN: usize = SIFT_LEN;

    fn from_row(row: &[f32]) -> Option<Self> {
        <[f32; SIFT_LEN]>::try_from(row).ok().map(SiftDesc)
    }

    #[inline]
    fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let d = (*a - *b) as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    fn mean(descriptors: &[&Self]) -> Self {
        let mut sums = [0f64; SIFT_LEN];
        for d in descriptors {
            for (s, v) in sums.iter_mut().zip(d.0.iter()) {
                *s += *v as f64;
            }
        }
        let inv = 1. / descriptors.len().max(1) as f64;
        let mut result = SiftDesc::zeros();
        for (r, s) in result.0.iter_mut().zip(sums.iter()) {
            *r = (*s * inv) as f32;
        }
        result
    }

    fn to_text(&self) -> String {
        self.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn from_text(fields: &[&str]) -> Option<Self> {
        if fields.len() != Self::LEN {
            return None;
        }
        let mut d = SiftDesc::zeros();
        for (slot, f) in d.0.iter_mut().zip(fields) {
            *slot = f.parse().ok()?;
        }
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_counts_all_256_bits() {
        let a: OrbDesc = [0; 32];
        let b: OrbDesc = [0xFF; 32];
        assert_eq!(a.distance(&b), 256.);
        assert_eq!(a.distance(&a), 0.);
    }

    #[test]
    fn binary_mean_is_majority_vote() {
        let a: OrbDesc = [0b1100_0000; 32];
        let b: OrbDesc = [0b1000_0000; 32];
        let c: OrbDesc = [0b0000_0001; 32];
        let m = OrbDesc::mean(&[&a, &b, &c]);
        assert_eq!(m, [0b1000_0000; 32]);
    }

    #[test]
    fn sift_mean_and_distance() {
        let mut a = SiftDesc::zeros();
        let mut b = SiftDesc::zeros();
        a.0[0] = 2.;
        b.0[0] = 4.;
        let m = SiftDesc::mean(&[&a, &b]);
        assert_eq!(m.0[0], 3.);
        assert!((a.distance(&b) - 2.).abs() < 1e-9);
    }

    #[test]
    fn text_form_rejects_wrong_length() {
        let fields = vec!["1"; 31];
        assert!(OrbDesc::from_text(&fields).is_none());
        let fields = vec!["0.5"; 128];
        assert_eq!(SiftDesc::from_text(&fields).unwrap().0[127], 0.5);
        assert!(SiftDesc::from_text(&vec!["0.5"; 32]).is_none());
    }

    #[test]
    fn sift_text_is_lossless() {
        let mut d = SiftDesc::zeros();
        for (i, v) in d.0.iter_mut().enumerate() {
            *v = (i as f32).sqrt() / 7.3;
        }
        let text = d.to_text();
        let fields: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(SiftDesc::from_text(&fields).unwrap(), d);
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("ORB".parse::<DescriptorKind>().unwrap(), DescriptorKind::Orb);
        assert_eq!("sift".parse::<DescriptorKind>().unwrap(), DescriptorKind::Sift);
        assert!("surf".parse::<DescriptorKind>().is_err());
    }
}
