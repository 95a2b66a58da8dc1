use smallvec::SmallVec;
use std::collections::BTreeMap;

use crate::ScoringType;

/// Index of a word/leaf in the vocabulary.
pub type WordId = usize;

/// Sparse Bag-of-Words representation of an image or descriptor set.
///
/// Key: word/leaf id in the vocabulary.
///
/// Value: total weight of that word in provided features.
pub type BoW = BTreeMap<WordId, f32>;

/// Ids of the internal nodes on the way to a word followed by the word id.
pub type WordPath = SmallVec<[usize; 8]>;

/// This type represents a map from features to their corresponding nodes in the Vocabulary tree.
///
/// The direct index for `feature[i]` is `di = DirectIdx[i]` where
/// `di.len() <= l` (number of levels), and `di[j]` is the id of the node matching `feature[i]`
/// at level `j` in the Vocabulary tree.
pub type DirectIdx = Vec<WordPath>;

/// Smallest value substituted for missing entries in the KL divergence.
const LOG_EPS: f64 = f64::EPSILON;

/// Provides method(s) for computing the similarity score between bow vectors.
pub trait BoWTrait {
    /// Compute L1 norm between two BoW. (Used in Galvez (Eq 2)).
    fn l1(&self, other: &Self) -> f32;
    fn l2(&self, other: &Self) -> f32;
    /// Score with the given measure. Higher is more similar except for KL,
    /// which is a divergence.
    fn score(&self, other: &Self, scoring: ScoringType) -> f32;
    /// Scale so the vector has unit norm for the measure (L2 for L2, L1 otherwise).
    fn normalize(&mut self, scoring: ScoringType);
}

impl BoWTrait for BoW {
    fn l1(&self, other: &Self) -> f32 {
        let mut diff = 0.;
        merge(self, other, |a, b| diff += (a - b).abs());
        (1. - 0.5 * diff) as f32
    }

    fn l2(&self, other: &Self) -> f32 {
        let mut dot = 0.;
        merge(self, other, |a, b| dot += a * b);
        if dot >= 1. {
            1.
        } else {
            (1. - (1. - dot).max(0.).sqrt()) as f32
        }
    }

    fn score(&self, other: &Self, scoring: ScoringType) -> f32 {
        match scoring {
            ScoringType::L1Norm => self.l1(other),
            ScoringType::L2Norm => self.l2(other),
            ScoringType::ChiSquare => {
                let mut s = 0.;
                merge(self, other, |a, b| {
                    if a + b > 0. {
                        s += a * b / (a + b);
                    }
                });
                (2. * s) as f32
            }
            ScoringType::Kl => {
                let mut s = 0.;
                merge(self, other, |a, b| {
                    if a > 0. {
                        s += a * (a.ln() - if b > 0. { b.ln() } else { LOG_EPS.ln() });
                    }
                });
                s as f32
            }
            ScoringType::Bhattacharyya => {
                let mut s = 0.;
                merge(self, other, |a, b| s += (a * b).sqrt());
                s as f32
            }
            ScoringType::DotProduct => {
                let mut s = 0.;
                merge(self, other, |a, b| s += a * b);
                s as f32
            }
        }
    }

    fn normalize(&mut self, scoring: ScoringType) {
        let norm: f32 = match scoring {
            ScoringType::DotProduct => return,
            ScoringType::L2Norm => self.values().map(|v| v * v).sum::<f32>().sqrt(),
            _ => self.values().map(|v| v.abs()).sum(),
        };
        if norm > 0. {
            let inv = 1. / norm;
            for w in self.values_mut() {
                *w *= inv;
            }
        }
    }
}

/// Visit every word present in either vector with both weights (0 when absent).
fn merge(a: &BoW, b: &BoW, mut f: impl FnMut(f64, f64)) {
    let mut ia = a.iter().peekable();
    let mut ib = b.iter().peekable();
    loop {
        match (ia.peek(), ib.peek()) {
            (Some((ka, va)), Some((kb, vb))) => {
                if ka == kb {
                    f(**va as f64, **vb as f64);
                    ia.next();
                    ib.next();
                } else if ka < kb {
                    f(**va as f64, 0.);
                    ia.next();
                } else {
                    f(0., **vb as f64);
                    ib.next();
                }
            }
            (Some((_, va)), None) => {
                f(**va as f64, 0.);
                ia.next();
            }
            (None, Some((_, vb))) => {
                f(0., **vb as f64);
                ib.next();
            }
            (None, None) => break,
        }
    }
}
