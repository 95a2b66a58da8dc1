//! Floating point SIFT extraction on a device kernel set.
//!
//! The kernels themselves sit behind [`SiftDevice`]. [`SiftExtractor`] owns
//! the device and a reusable [`SiftData`] point buffer for the whole run and
//! leases temporary device memory per image through [`TempMemory`], which
//! frees the lease when it goes out of scope, whether extraction succeeded
//! or not.

use image::{GrayImage, ImageBuffer, Luma};
use tracing::{debug, trace};

use super::{DescriptorExtractor, DescriptorMatrix};
use crate::{config::SiftParams, desc::SIFT_LEN, BowErr, BowResult, SiftDesc};

/// CPU implementation of the device kernels.
pub mod host;
pub use host::HostSiftDevice;

/// Single channel float image as uploaded to the device.
pub type DeviceImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// One detected scale-space feature.
#[derive(Debug, Clone, PartialEq)]
pub struct SiftPoint {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub orientation: f32,
    /// Absolute difference-of-gaussians response.
    pub score: f32,
    pub data: [f32; SIFT_LEN],
}

/// Point buffer shared between host and device, reused across images.
#[derive(Debug)]
pub struct SiftData {
    max_pts: usize,
    points: Vec<SiftPoint>,
}

impl SiftData {
    pub fn new(max_pts: usize) -> Self {
        Self {
            max_pts,
            points: Vec::with_capacity(max_pts),
        }
    }

    pub fn max_pts(&self) -> usize {
        self.max_pts
    }

    pub fn num_pts(&self) -> usize {
        self.points.len()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.max_pts
    }

    pub fn points(&self) -> &[SiftPoint] {
        &self.points
    }

    /// Append a point. Returns `false` once the buffer is full.
    pub fn push(&mut self, point: SiftPoint) -> bool {
        if self.is_full() {
            return false;
        }
        self.points.push(point);
        true
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Drop the buffer's storage.
    pub fn release(&mut self) {
        self.points = Vec::new();
    }
}

/// The SIFT kernel set of a compute device.
pub trait SiftDevice {
    /// Handle to a block of temporary device memory.
    type Temp;

    /// Reserve scratch memory for a `width` x `height` scale space.
    fn alloc_temp(
        &mut self,
        width: u32,
        height: u32,
        octaves: u32,
        upscale: bool,
    ) -> BowResult<Self::Temp>;

    fn free_temp(&mut self, temp: Self::Temp);

    /// Detect features in `image`, appending them to `data` until it is full.
    fn extract(
        &mut self,
        image: &DeviceImage,
        params: &SiftParams,
        temp: &mut Self::Temp,
        data: &mut SiftData,
    ) -> BowResult<()>;

    /// Release device-side resources attached to `data`.
    fn release(&mut self, data: &mut SiftData) {
        data.release();
    }
}

/// Scoped lease of temporary device memory, freed on drop.
pub struct TempMemory<'a, B: SiftDevice> {
    device: &'a mut B,
    temp: Option<B::Temp>,
}

impl<'a, B: SiftDevice> TempMemory<'a, B> {
    pub fn acquire(
        device: &'a mut B,
        width: u32,
        height: u32,
        octaves: u32,
        upscale: bool,
    ) -> BowResult<Self> {
        let temp = device.alloc_temp(width, height, octaves, upscale)?;
        Ok(Self {
            device,
            temp: Some(temp),
        })
    }

    /// Run the kernels with this lease as scratch space.
    pub fn extract(
        &mut self,
        image: &DeviceImage,
        params: &SiftParams,
        data: &mut SiftData,
    ) -> BowResult<()> {
        let temp = self
            .temp
            .as_mut()
            .ok_or_else(|| BowErr::Device("temporary memory already released".to_string()))?;
        self.device.extract(image, params, temp, data)
    }
}

impl<B: SiftDevice> Drop for TempMemory<'_, B> {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            self.device.free_temp(temp);
        }
    }
}

/// Floating descriptor extractor. Strictly sequential: one device, one context.
pub struct SiftExtractor<B: SiftDevice> {
    device: B,
    data: SiftData,
    params: SiftParams,
}

impl<B: SiftDevice> SiftExtractor<B> {
    /// Take ownership of the device and create the reusable point buffer.
    pub fn new(device: B, params: SiftParams) -> Self {
        let data = SiftData::new(params.max_points);
        Self {
            device,
            data,
            params,
        }
    }

    pub fn params(&self) -> &SiftParams {
        &self.params
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    /// Points found in the most recent image.
    pub fn last_points(&self) -> &[SiftPoint] {
        self.data.points()
    }
}

impl<B: SiftDevice> Drop for SiftExtractor<B> {
    fn drop(&mut self) {
        self.device.release(&mut self.data);
    }
}

impl<B: SiftDevice> DescriptorExtractor for SiftExtractor<B> {
    type Descriptor = SiftDesc;

    fn extract(&mut self, image: &GrayImage) -> BowResult<DescriptorMatrix<f32>> {
        let (w, h) = image.dimensions();
        self.data.clear();
        if w == 0 || h == 0 {
            return Ok(DescriptorMatrix::new(SIFT_LEN));
        }

        let upload: DeviceImage =
            ImageBuffer::from_fn(w, h, |x, y| Luma([image.get_pixel(x, y)[0] as f32]));
        let factor = if self.params.upscale { 2 } else { 1 };
        {
            let mut temp = TempMemory::acquire(
                &mut self.device,
                w * factor,
                h * factor,
                self.params.octaves,
                false,
            )?;
            temp.extract(&upload, &self.params, &mut self.data)?;
        }
        trace!("SIFT: {} points in {}x{} image", self.data.num_pts(), w, h);
        if self.data.is_full() {
            debug!("SIFT point buffer full ({} points)", self.data.max_pts());
        }

        let mut matrix = DescriptorMatrix::new(SIFT_LEN);
        for p in self.data.points() {
            matrix.push_row(&p.data)?;
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BowErr;
    use std::{cell::Cell, rc::Rc};

    #[derive(Default)]
    struct Counters {
        allocs: Cell<usize>,
        frees: Cell<usize>,
        releases: Cell<usize>,
    }

    /// Device that emits a fixed number of points, or fails on demand.
    struct MockDevice {
        counters: Rc<Counters>,
        points: usize,
        fail: bool,
    }

    impl SiftDevice for MockDevice {
        type Temp = usize;

        fn alloc_temp(&mut self, w: u32, h: u32, _: u32, _: bool) -> BowResult<usize> {
            self.counters.allocs.set(self.counters.allocs.get() + 1);
            Ok((w * h) as usize)
        }

        fn free_temp(&mut self, _temp: usize) {
            self.counters.frees.set(self.counters.frees.get() + 1);
        }

        fn extract(
            &mut self,
            _image: &DeviceImage,
            _params: &SiftParams,
            _temp: &mut usize,
            data: &mut SiftData,
        ) -> BowResult<()> {
            if self.fail {
                return Err(BowErr::Device("kernel launch failed".into()));
            }
            for i in 0..self.points {
                let mut d = [0.; SIFT_LEN];
                d[i % SIFT_LEN] = 1.;
                let point = SiftPoint {
                    x: i as f32,
                    y: 0.,
                    scale: 1.,
                    orientation: 0.,
                    score: 1.,
                    data: d,
                };
                if !data.push(point) {
                    break;
                }
            }
            Ok(())
        }

        fn release(&mut self, data: &mut SiftData) {
            self.counters.releases.set(self.counters.releases.get() + 1);
            data.release();
        }
    }

    fn mock(points: usize, fail: bool) -> (MockDevice, Rc<Counters>) {
        let counters = Rc::new(Counters::default());
        let dev = MockDevice {
            counters: counters.clone(),
            points,
            fail,
        };
        (dev, counters)
    }

    #[test]
    fn temp_memory_freed_after_success() {
        let (dev, counters) = mock(5, false);
        let mut ex = SiftExtractor::new(dev, SiftParams::default());
        let img = GrayImage::new(16, 8);
        let m = ex.extract(&img).unwrap();
        assert_eq!(m.rows(), 5);
        assert_eq!(m.cols(), 128);
        ex.extract(&img).unwrap();
        assert_eq!(counters.allocs.get(), 2);
        assert_eq!(counters.frees.get(), 2);
    }

    #[test]
    fn temp_memory_freed_after_failure() {
        let (dev, counters) = mock(5, true);
        let mut ex = SiftExtractor::new(dev, SiftParams::default());
        let err = ex.extract(&GrayImage::new(16, 8)).unwrap_err();
        assert!(matches!(err, BowErr::Device(_)));
        assert_eq!(counters.allocs.get(), 1);
        assert_eq!(counters.frees.get(), 1);
    }

    #[test]
    fn context_released_on_drop() {
        let (dev, counters) = mock(1, false);
        {
            let mut ex = SiftExtractor::new(dev, SiftParams::default());
            ex.extract(&GrayImage::new(4, 4)).unwrap();
        }
        assert_eq!(counters.releases.get(), 1);
    }

    #[test]
    fn downloads_at_most_max_points() {
        let (dev, _) = mock(50, false);
        let params = SiftParams {
            max_points: 20,
            ..SiftParams::default()
        };
        let mut ex = SiftExtractor::new(dev, params);
        assert_eq!(ex.extract(&GrayImage::new(8, 8)).unwrap().rows(), 20);
    }

    #[test]
    fn zero_points_is_an_empty_set() {
        let (dev, _) = mock(0, false);
        let mut ex = SiftExtractor::new(dev, SiftParams::default());
        assert!(ex.extract(&GrayImage::new(8, 8)).unwrap().is_empty());
    }

    #[test]
    fn upscaled_lease_is_doubled() {
        struct SizeProbe(Rc<Cell<(u32, u32)>>);
        impl SiftDevice for SizeProbe {
            type Temp = ();
            fn alloc_temp(&mut self, w: u32, h: u32, _: u32, _: bool) -> BowResult<()> {
                self.0.set((w, h));
                Ok(())
            }
            fn free_temp(&mut self, _: ()) {}
            fn extract(
                &mut self,
                _: &DeviceImage,
                _: &SiftParams,
                _: &mut (),
                _: &mut SiftData,
            ) -> BowResult<()> {
                Ok(())
            }
        }
        let size = Rc::new(Cell::new((0, 0)));
        let mut ex = SiftExtractor::new(SizeProbe(size.clone()), SiftParams::default());
        ex.extract(&GrayImage::new(30, 20)).unwrap();
        assert_eq!(size.get(), (60, 40));
    }
}
