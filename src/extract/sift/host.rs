//! Reference SIFT kernels executed on the host.
//!
//! Follows the usual difference-of-gaussians pipeline: optional 2x upsampling,
//! `S = 3` scales per octave, 3x3x3 extremum detection above a contrast
//! threshold, edge-response rejection, one dominant orientation per point and
//! a 4x4x8 gradient histogram descriptor.

use std::f32::consts::PI;

use super::{DeviceImage, SiftData, SiftDevice, SiftPoint};
use crate::{config::SiftParams, desc::SIFT_LEN, BowErr, BowResult};

const SCALES_PER_OCTAVE: usize = 3;
const SIGMA0: f32 = 1.6;
const BORDER: usize = 5;
const EDGE_RATIO: f32 = 10.0;
const ORI_BINS: usize = 36;
const DESC_WIDTH: usize = 4;
const DESC_BINS: usize = 8;
const DESC_MAG_CLAMP: f32 = 0.2;

/// Host "device": scratch memory is ordinary heap memory.
#[derive(Debug, Default)]
pub struct HostSiftDevice {
    live_leases: usize,
}

impl HostSiftDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Temporary blocks currently handed out.
    pub fn live_leases(&self) -> usize {
        self.live_leases
    }
}

/// Scratch block sized for the largest octave.
#[derive(Debug)]
pub struct HostScratch {
    width: usize,
    height: usize,
    row_pass: Vec<f32>,
}

impl SiftDevice for HostSiftDevice {
    type Temp = HostScratch;

    fn alloc_temp(
        &mut self,
        width: u32,
        height: u32,
        octaves: u32,
        upscale: bool,
    ) -> BowResult<HostScratch> {
        let factor = if upscale { 2 } else { 1 };
        let (width, height) = ((width * factor) as usize, (height * factor) as usize);
        if width == 0 || height == 0 || octaves == 0 {
            return Err(BowErr::Device(format!(
                "cannot allocate scratch for {}x{} image with {} octaves",
                width, height, octaves
            )));
        }
        self.live_leases += 1;
        Ok(HostScratch {
            width,
            height,
            row_pass: vec![0.; width * height],
        })
    }

    fn free_temp(&mut self, _temp: HostScratch) {
        self.live_leases = self.live_leases.saturating_sub(1);
    }

    fn extract(
        &mut self,
        image: &DeviceImage,
        params: &SiftParams,
        temp: &mut HostScratch,
        data: &mut SiftData,
    ) -> BowResult<()> {
        let mut base = Plane::from_image(image);
        let mut input_blur = params.init_blur;
        if params.upscale {
            base = base.upsample2();
            input_blur *= 2.;
        }
        if base.w > temp.width || base.h > temp.height {
            return Err(BowErr::Device(format!(
                "scratch for {}x{} too small for {}x{} octave",
                temp.width, temp.height, base.w, base.h
            )));
        }
        let coord_scale = if params.upscale { 0.5 } else { 1. };

        let sig_diff = (SIGMA0 * SIGMA0 - input_blur * input_blur).max(0.01).sqrt();
        base = base.blur(sig_diff, &mut temp.row_pass);

        let k = 2f32.powf(1. / SCALES_PER_OCTAVE as f32);
        let increments: Vec<f32> = (1..SCALES_PER_OCTAVE + 3)
            .map(|i| {
                let prev = SIGMA0 * k.powi(i as i32 - 1);
                let total = prev * k;
                (total * total - prev * prev).sqrt()
            })
            .collect();

        for octave in 0..params.octaves {
            if base.w < 2 * BORDER + 3 || base.h < 2 * BORDER + 3 {
                break;
            }
            let mut gauss = vec![base];
            for inc in &increments {
                let next = gauss[gauss.len() - 1].blur(*inc, &mut temp.row_pass);
                gauss.push(next);
            }
            let dog: Vec<Plane> = gauss.windows(2).map(|p| p[1].minus(&p[0])).collect();
            let octave_scale = 2f32.powi(octave as i32) * coord_scale;

            for s in 1..=SCALES_PER_OCTAVE {
                let sigma = SIGMA0 * k.powi(s as i32);
                let scale = sigma * octave_scale;
                if scale < params.lowest_scale {
                    continue;
                }
                let (w, h) = (dog[s].w, dog[s].h);
                for y in BORDER..h - BORDER {
                    for x in BORDER..w - BORDER {
                        let v = dog[s].at(x, y);
                        if v.abs() <= params.threshold
                            || !is_extremum(&dog[s - 1..=s + 1], x, y, v)
                            || is_edge(&dog[s], x, y)
                        {
                            continue;
                        }
                        let orientation = dominant_orientation(&gauss[s], x, y, sigma);
                        let descriptor = match describe(&gauss[s], x, y, sigma, orientation) {
                            Some(d) => d,
                            None => continue,
                        };
                        let point = SiftPoint {
                            x: x as f32 * octave_scale,
                            y: y as f32 * octave_scale,
                            scale,
                            orientation,
                            score: v.abs(),
                            data: descriptor,
                        };
                        if !data.push(point) {
                            return Ok(());
                        }
                    }
                }
            }

            base = gauss.swap_remove(SCALES_PER_OCTAVE).downsample2();
        }
        Ok(())
    }
}

/// Row-major float plane.
#[derive(Debug, Clone)]
struct Plane {
    w: usize,
    h: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_image(image: &DeviceImage) -> Self {
        Self {
            w: image.width() as usize,
            h: image.height() as usize,
            data: image.as_raw().clone(),
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.w + x]
    }

    #[inline]
    fn clamped(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, self.w as i64 - 1) as usize;
        let y = y.clamp(0, self.h as i64 - 1) as usize;
        self.at(x, y)
    }

    fn upsample2(&self) -> Self {
        let (w, h) = (self.w * 2, self.h * 2);
        let mut data = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                // bilinear, pixel centers aligned
                let sx = (x as f32 + 0.5) / 2. - 0.5;
                let sy = (y as f32 + 0.5) / 2. - 0.5;
                let (x0, y0) = (sx.floor(), sy.floor());
                let (fx, fy) = (sx - x0, sy - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let top = self.clamped(x0, y0) * (1. - fx) + self.clamped(x0 + 1, y0) * fx;
                let bottom =
                    self.clamped(x0, y0 + 1) * (1. - fx) + self.clamped(x0 + 1, y0 + 1) * fx;
                data.push(top * (1. - fy) + bottom * fy);
            }
        }
        Self { w, h, data }
    }

    fn downsample2(&self) -> Self {
        let (w, h) = (self.w / 2, self.h / 2);
        let mut data = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                data.push(self.at(x * 2, y * 2));
            }
        }
        Self { w, h, data }
    }

    fn minus(&self, other: &Plane) -> Self {
        Self {
            w: self.w,
            h: self.h,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a - b)
                .collect(),
        }
    }

    /// Separable gaussian blur, clamping at the borders. `row_pass` holds the
    /// horizontal pass.
    fn blur(&self, sigma: f32, row_pass: &mut Vec<f32>) -> Self {
        let radius = (3. * sigma).ceil().max(1.) as i64;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-((i * i) as f32) / (2. * sigma * sigma)).exp())
            .collect();
        let norm: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= norm);

        row_pass.clear();
        row_pass.resize(self.w * self.h, 0.);
        for y in 0..self.h {
            for x in 0..self.w {
                let mut acc = 0.;
                for (i, k) in kernel.iter().enumerate() {
                    acc += k * self.clamped(x as i64 + i as i64 - radius, y as i64);
                }
                row_pass[y * self.w + x] = acc;
            }
        }

        let mut data = vec![0.; self.w * self.h];
        for y in 0..self.h {
            for x in 0..self.w {
                let mut acc = 0.;
                for (i, k) in kernel.iter().enumerate() {
                    let yy = (y as i64 + i as i64 - radius).clamp(0, self.h as i64 - 1) as usize;
                    acc += k * row_pass[yy * self.w + x];
                }
                data[y * self.w + x] = acc;
            }
        }
        Self {
            w: self.w,
            h: self.h,
            data,
        }
    }

    /// Gradient magnitude and angle by central differences.
    fn gradient(&self, x: i64, y: i64) -> (f32, f32) {
        let dx = self.clamped(x + 1, y) - self.clamped(x - 1, y);
        let dy = self.clamped(x, y + 1) - self.clamped(x, y - 1);
        ((dx * dx + dy * dy).sqrt(), dy.atan2(dx))
    }
}

/// Strict maximum or minimum over the 3x3x3 neighbourhood.
fn is_extremum(dogs: &[Plane], x: usize, y: usize, v: f32) -> bool {
    let maximum = v > 0.;
    for (layer, plane) in dogs.iter().enumerate() {
        for dy in 0..3 {
            for dx in 0..3 {
                if layer == 1 && dx == 1 && dy == 1 {
                    continue;
                }
                let n = plane.at(x + dx - 1, y + dy - 1);
                if (maximum && n >= v) || (!maximum && n <= v) {
                    return false;
                }
            }
        }
    }
    true
}

/// Principal curvature ratio test on the 2x2 Hessian.
fn is_edge(dog: &Plane, x: usize, y: usize) -> bool {
    let v = dog.at(x, y);
    let dxx = dog.at(x + 1, y) + dog.at(x - 1, y) - 2. * v;
    let dyy = dog.at(x, y + 1) + dog.at(x, y - 1) - 2. * v;
    let dxy = (dog.at(x + 1, y + 1) - dog.at(x - 1, y + 1) - dog.at(x + 1, y - 1)
        + dog.at(x - 1, y - 1))
        / 4.;
    let tr = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    det <= 0. || tr * tr * EDGE_RATIO >= (EDGE_RATIO + 1.) * (EDGE_RATIO + 1.) * det
}

fn dominant_orientation(img: &Plane, x: usize, y: usize, sigma: f32) -> f32 {
    let ori_sigma = 1.5 * sigma;
    let radius = (3. * ori_sigma).round() as i64;
    let mut hist = [0f32; ORI_BINS];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let (mag, angle) = img.gradient(x as i64 + dx, y as i64 + dy);
            let weight = (-((dx * dx + dy * dy) as f32) / (2. * ori_sigma * ori_sigma)).exp();
            let bin = (((angle + PI) / (2. * PI)) * ORI_BINS as f32) as usize % ORI_BINS;
            hist[bin] += weight * mag;
        }
    }
    let best = hist
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
        .0;
    (best as f32 + 0.5) / ORI_BINS as f32 * 2. * PI - PI
}

/// 4x4 spatial cells x 8 orientation bins with trilinear interpolation.
fn describe(img: &Plane, x: usize, y: usize, sigma: f32, orientation: f32) -> Option<[f32; SIFT_LEN]> {
    let d = DESC_WIDTH as f32;
    let hist_width = 3. * sigma;
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d + 1.) / 2.).round() as i64;
    let (sin, cos) = orientation.sin_cos();
    let (c, s) = (cos / hist_width, sin / hist_width);
    let win_sigma = 0.5 * d;
    let mut hist = [0f32; SIFT_LEN];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let x_rot = j as f32 * c + i as f32 * s;
            let y_rot = -(j as f32) * s + i as f32 * c;
            let rbin = y_rot + d / 2. - 0.5;
            let cbin = x_rot + d / 2. - 0.5;
            if rbin <= -1. || rbin >= d || cbin <= -1. || cbin >= d {
                continue;
            }
            let (mag, angle) = img.gradient(x as i64 + j, y as i64 + i);
            let mut rel = angle - orientation;
            while rel < 0. {
                rel += 2. * PI;
            }
            while rel >= 2. * PI {
                rel -= 2. * PI;
            }
            let obin = rel * DESC_BINS as f32 / (2. * PI);
            let weight = (-(x_rot * x_rot + y_rot * y_rot) / (2. * win_sigma * win_sigma)).exp();
            let value = mag * weight;

            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (fr, fc, fo) = (rbin - r0, cbin - c0, obin - o0);
            for (ri, wr) in [(r0 as i64, 1. - fr), (r0 as i64 + 1, fr)] {
                if ri < 0 || ri >= DESC_WIDTH as i64 {
                    continue;
                }
                for (ci, wc) in [(c0 as i64, 1. - fc), (c0 as i64 + 1, fc)] {
                    if ci < 0 || ci >= DESC_WIDTH as i64 {
                        continue;
                    }
                    for (oi, wo) in [(o0 as i64, 1. - fo), (o0 as i64 + 1, fo)] {
                        let ob = oi.rem_euclid(DESC_BINS as i64) as usize;
                        let cell = (ri as usize * DESC_WIDTH + ci as usize) * DESC_BINS;
                        hist[cell + ob] += value * wr * wc * wo;
                    }
                }
            }
        }
    }

    normalize(&mut hist)?;
    hist.iter_mut().for_each(|v| *v = v.min(DESC_MAG_CLAMP));
    normalize(&mut hist)?;
    Some(hist)
}

fn normalize(v: &mut [f32]) -> Option<()> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(())
}
