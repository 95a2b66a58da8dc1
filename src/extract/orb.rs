use image::{
    imageops::{self, FilterType},
    GrayImage,
};
use imageproc::filter::gaussian_blur_f32;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use super::{DescriptorExtractor, DescriptorMatrix};
use crate::{config::OrbConfig, BowResult, OrbDesc};

/// Bresenham circle of radius 3 used by the FAST segment test.
const FAST_OFFSETS: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Contiguous arc length required by FAST-9.
const FAST_ARC: usize = 9;

/// 256 comparisons = 32 bytes.
const PATTERN_PAIRS: usize = 256;

/// Sampling pattern seed. Changing it changes every descriptor.
const PATTERN_SEED: u64 = 0x0b_0b_0b_0b;

/// Sigma of the smoothing applied before BRIEF sampling.
const BRIEF_SIGMA: f32 = 2.0;

/// Key-point = FAST corner + orientation (radians), in full resolution coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub response: f32,
    pub level: usize,
}

/// CPU binary descriptor extractor producing 32-byte rotated BRIEF descriptors.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    cfg: OrbConfig,
    /// (x1, y1, x2, y2) offsets relative to the keypoint before rotation.
    pattern: Vec<(f32, f32, f32, f32)>,
    /// Half-width of the circular patch at each row offset.
    umax: Vec<i32>,
}

impl OrbExtractor {
    pub fn new(cfg: OrbConfig) -> Self {
        let half = (cfg.patch_size / 2) as i32;
        let umax = (0..=half)
            .map(|v| (((half * half - v * v) as f32).sqrt()).floor() as i32)
            .collect();

        // Pairs drawn from a disk so they stay inside the patch under any rotation.
        let r = (half - 2).max(1);
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut sample = || loop {
            let x = rng.gen_range(-r..=r);
            let y = rng.gen_range(-r..=r);
            if x * x + y * y <= r * r {
                return (x as f32, y as f32);
            }
        };
        let pattern = (0..PATTERN_PAIRS)
            .map(|_| {
                let (x1, y1) = sample();
                let (x2, y2) = sample();
                (x1, y1, x2, y2)
            })
            .collect();

        Self { cfg, pattern, umax }
    }

    pub fn config(&self) -> &OrbConfig {
        &self.cfg
    }

    /// Detect keypoints over the image pyramid and compute their descriptors.
    pub fn detect_and_compute(&self, img: &GrayImage) -> (Vec<Keypoint>, Vec<OrbDesc>) {
        let border = self.border();
        let budget = self.features_per_level();
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();

        for (level, (level_img, scale)) in self.build_pyramid(img).into_iter().enumerate() {
            let mut corners = self.detect_fast(&level_img, border);
            corners.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
            corners.truncate(budget.get(level).copied().unwrap_or(0));
            if corners.is_empty() {
                continue;
            }
            trace!("ORB level {}: {} corners", level, corners.len());

            let blurred = gaussian_blur_f32(&level_img, BRIEF_SIGMA);
            for (x, y, response) in corners {
                let angle = self.orientation(&level_img, x, y);
                descriptors.push(self.describe(&blurred, x, y, angle));
                keypoints.push(Keypoint {
                    x: x as f32 * scale,
                    y: y as f32 * scale,
                    angle,
                    response,
                    level,
                });
            }
        }

        (keypoints, descriptors)
    }

    fn border(&self) -> u32 {
        (self.cfg.patch_size / 2 + 1).max(3) as u32
    }

    /// Split `max_features` across levels proportionally to each level's area.
    fn features_per_level(&self) -> Vec<usize> {
        let levels = self.cfg.n_levels.max(1);
        let factor = 1. / self.cfg.scale_factor as f64;
        let mut per_level = if levels == 1 {
            self.cfg.max_features as f64
        } else {
            self.cfg.max_features as f64 * (1. - factor) / (1. - factor.powi(levels as i32))
        };
        let mut out = Vec::with_capacity(levels);
        let mut assigned = 0;
        for _ in 0..levels - 1 {
            let n = (per_level.round() as usize).min(self.cfg.max_features - assigned);
            out.push(n);
            assigned += n;
            per_level *= factor;
        }
        out.push(self.cfg.max_features.saturating_sub(assigned));
        out
    }

    /// Downscaled copies of the image with the factor mapping level pixels back to level 0.
    fn build_pyramid(&self, img: &GrayImage) -> Vec<(GrayImage, f32)> {
        let min_side = 2 * self.border() + 1;
        let mut levels = Vec::new();
        for level in 0..self.cfg.n_levels.max(1) {
            let scale = self.cfg.scale_factor.powi(level as i32);
            let w = (img.width() as f32 / scale).round() as u32;
            let h = (img.height() as f32 / scale).round() as u32;
            if w < min_side || h < min_side {
                break;
            }
            let level_img = if level == 0 {
                img.clone()
            } else {
                imageops::resize(img, w, h, FilterType::Triangle)
            };
            levels.push((level_img, scale));
        }
        levels
    }

    /// FAST-9 corners with 3x3 non-maximum suppression: (x, y, score).
    fn detect_fast(&self, img: &GrayImage, border: u32) -> Vec<(u32, u32, f32)> {
        let (w, h) = img.dimensions();
        if w < 2 * border + 1 || h < 2 * border + 1 {
            return Vec::new();
        }
        let t = self.cfg.fast_threshold as i32;
        let raw = img.as_raw();
        let width = w as usize;
        let mut scores = vec![0f32; (w * h) as usize];

        for y in border..h - border {
            for x in border..w - border {
                let idx = y as usize * width + x as usize;
                let p = raw[idx] as i32;
                let mut ring = [0i32; 16];
                for (slot, &(dx, dy)) in ring.iter_mut().zip(FAST_OFFSETS.iter()) {
                    let q = ((y as i32 + dy) as usize) * width + (x as i32 + dx) as usize;
                    *slot = raw[q] as i32;
                }
                if let Some(score) = segment_score(p, &ring, t) {
                    scores[idx] = score;
                }
            }
        }

        let mut corners = Vec::new();
        for y in border..h - border {
            for x in border..w - border {
                let idx = y as usize * width + x as usize;
                let s = scores[idx];
                if s <= 0. {
                    continue;
                }
                let mut is_max = true;
                'nms: for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let n = ((y as i32 + dy) as usize) * width + (x as i32 + dx) as usize;
                        // ties go to the earlier pixel
                        if scores[n] > s || (scores[n] == s && n < idx) {
                            is_max = false;
                            break 'nms;
                        }
                    }
                }
                if is_max {
                    corners.push((x, y, s));
                }
            }
        }
        corners
    }

    /// Intensity centroid angle over the circular patch.
    fn orientation(&self, img: &GrayImage, x: u32, y: u32) -> f32 {
        let (w, h) = img.dimensions();
        let half = self.umax.len() as i32 - 1;
        let mut m01 = 0i64;
        let mut m10 = 0i64;
        for dy in -half..=half {
            let yy = (y as i32 + dy).clamp(0, h as i32 - 1) as u32;
            let span = self.umax[dy.unsigned_abs() as usize];
            for dx in -span..=span {
                let xx = (x as i32 + dx).clamp(0, w as i32 - 1) as u32;
                let val = img.get_pixel(xx, yy)[0] as i64;
                m10 += dx as i64 * val;
                m01 += dy as i64 * val;
            }
        }
        (m01 as f32).atan2(m10 as f32)
    }

    fn describe(&self, img: &GrayImage, x: u32, y: u32, angle: f32) -> OrbDesc {
        let (w, h) = img.dimensions();
        let (s, c) = angle.sin_cos();
        let (cx, cy) = (x as f32, y as f32);
        let sample = |dx: f32, dy: f32| {
            let rx = (cx + c * dx - s * dy).round().clamp(0., (w - 1) as f32) as u32;
            let ry = (cy + s * dx + c * dy).round().clamp(0., (h - 1) as f32) as u32;
            img.get_pixel(rx, ry)[0]
        };
        let mut d = [0u8; 32];
        for (i, &(x1, y1, x2, y2)) in self.pattern.iter().enumerate() {
            let bit = (sample(x1, y1) < sample(x2, y2)) as u8;
            d[i / 8] |= bit << (i % 8);
        }
        d
    }
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self::new(OrbConfig::default())
    }
}

impl DescriptorExtractor for OrbExtractor {
    type Descriptor = OrbDesc;

    fn extract(&mut self, image: &GrayImage) -> BowResult<DescriptorMatrix<u8>> {
        let (_, descriptors) = self.detect_and_compute(image);
        let data: Vec<u8> = descriptors.iter().flatten().copied().collect();
        DescriptorMatrix::from_vec(descriptors.len(), 32, data)
    }
}

/// FAST segment test: `Some(score)` when at least `FAST_ARC` contiguous ring
/// pixels are all brighter or all darker than the center by more than `t`.
fn segment_score(p: i32, ring: &[i32; 16], t: i32) -> Option<f32> {
    let class = |q: i32| {
        if q > p + t {
            1i8
        } else if q < p - t {
            -1
        } else {
            0
        }
    };
    // quick rejection on the compass points
    let compass = [ring[0], ring[4], ring[8], ring[12]];
    let bright = compass.iter().filter(|&&q| class(q) == 1).count();
    let dark = compass.iter().filter(|&&q| class(q) == -1).count();
    if bright < 2 && dark < 2 {
        return None;
    }

    for want in [1i8, -1] {
        let mut run = 0;
        for i in 0..16 + FAST_ARC - 1 {
            if class(ring[i % 16]) == want {
                run += 1;
                if run >= FAST_ARC {
                    let score = ring
                        .iter()
                        .map(|&q| ((q - p) * want as i32 - t).max(0))
                        .sum::<i32>();
                    return Some(score.max(1) as f32);
                }
            } else {
                run = 0;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn noise(w: u32, h: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = GrayImage::new(w, h);
        // 4x4 blocks keep corners stable across pyramid levels
        let blocks: Vec<u8> = (0..((w / 4 + 1) * (h / 4 + 1))).map(|_| rng.gen()).collect();
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Luma([blocks[((y / 4) * (w / 4 + 1) + x / 4) as usize]]);
        }
        img
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let mut orb = OrbExtractor::default();
        let img = GrayImage::from_pixel(120, 90, Luma([128]));
        let m = orb.extract(&img).unwrap();
        assert!(m.is_empty());
        assert_eq!(m.cols(), 32);
    }

    #[test]
    fn tiny_image_is_not_an_error() {
        let mut orb = OrbExtractor::default();
        let img = GrayImage::from_pixel(10, 10, Luma([3]));
        assert!(orb.extract(&img).unwrap().is_empty());
    }

    #[test]
    fn textured_image_respects_feature_cap() {
        let cfg = OrbConfig {
            max_features: 120,
            ..OrbConfig::default()
        };
        let mut orb = OrbExtractor::new(cfg);
        let img = noise(256, 192, 7);
        let m = orb.extract(&img).unwrap();
        assert!(m.rows() > 0);
        assert!(m.rows() <= 120);
    }

    #[test]
    fn extraction_is_deterministic() {
        let img = noise(160, 160, 11);
        let a = OrbExtractor::default().detect_and_compute(&img).1;
        let b = OrbExtractor::default().detect_and_compute(&img).1;
        assert_eq!(a, b);
    }

    #[test]
    fn level_budget_sums_to_cap() {
        let orb = OrbExtractor::default();
        let budget = orb.features_per_level();
        assert_eq!(budget.len(), 8);
        assert_eq!(budget.iter().sum::<usize>(), 500);
        assert!(budget[0] > budget[7]);
    }

    #[test]
    fn segment_test_detects_bright_arc() {
        let mut ring = [10; 16];
        for v in ring.iter_mut().take(9) {
            *v = 200;
        }
        assert!(segment_score(10, &ring, 20).is_some());
        let ring = [12; 16];
        assert!(segment_score(10, &ring, 20).is_none());
    }
}
