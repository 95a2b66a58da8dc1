use crate::{extract::DescriptorExtractor, BowErr, BowResult, DescriptorMatrix, OrbDesc};
use image::GrayImage;
use opencv::{
    self,
    core::{Mat, Ptr, Scalar, CV_8UC1},
    features2d::ORB,
    prelude::*,
};

type CvMat = opencv::core::Mat;

/// ORB extraction delegated to OpenCV's `cv::ORB`.
pub struct OpencvOrbExtractor {
    orb: Ptr<dyn ORB>,
}

impl OpencvOrbExtractor {
    /// Detector with OpenCV's defaults, capped at `max_features` keypoints.
    pub fn new(max_features: i32) -> BowResult<Self> {
        let orb = <dyn ORB>::create(
            max_features,
            1.2,
            8,
            31,
            0,
            2,
            opencv::features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        Ok(Self { orb })
    }
}

impl DescriptorExtractor for OpencvOrbExtractor {
    type Descriptor = OrbDesc;

    fn extract(&mut self, image: &GrayImage) -> BowResult<DescriptorMatrix<u8>> {
        let (w, h) = image.dimensions();
        let mut cv_img =
            Mat::new_rows_cols_with_default(h as i32, w as i32, CV_8UC1, Scalar::all(0.))?;
        cv_img.data_typed_mut::<u8>()?.copy_from_slice(image.as_raw());

        // Detect keypoints and compute descriptors
        let mut kps = opencv::types::VectorOfKeyPoint::new();
        let mut desc = CvMat::default()?;
        let mask = CvMat::default()?;
        self.orb
            .detect_and_compute(&cv_img, &mask, &mut kps, &mut desc, false)?;

        // Copy data from CvMat into descriptor buffer
        let mut out = DescriptorMatrix::new(32);
        let mut row = [0u8; 32];
        for i in 0..desc.rows() {
            for (j, slot) in row.iter_mut().enumerate() {
                *slot = *desc.at_2d::<u8>(i, j as i32)?;
            }
            out.push_row(&row)?;
        }
        if out.rows() != kps.len() {
            return Err(BowErr::Device(format!(
                "opencv returned {} descriptors for {} keypoints",
                out.rows(),
                kps.len()
            )));
        }
        Ok(out)
    }
}
