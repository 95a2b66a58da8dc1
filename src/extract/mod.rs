use image::GrayImage;
use std::path::Path;

use crate::{BowErr, BowResult, Descriptor};

/// Pure Rust ORB: FAST corners, intensity-centroid orientation, rotated BRIEF.
pub mod orb;
pub use orb::{Keypoint, OrbExtractor};

/// Scale-space SIFT running on a device kernel set.
pub mod sift;
pub use sift::{HostSiftDevice, SiftData, SiftDevice, SiftExtractor, SiftPoint, TempMemory};

/// Raw descriptor output of an extractor: one row per keypoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorMatrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> DescriptorMatrix<T> {
    /// Empty matrix with `cols` components per row.
    pub fn new(cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            data: Vec::new(),
        }
    }

    /// Wrap row-major data. Fails if `data` is not `rows * cols` long.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> BowResult<Self> {
        if rows * cols != data.len() {
            return Err(BowErr::Device(format!(
                "descriptor buffer holds {} values, expected {} x {}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn push_row(&mut self, row: &[T]) -> BowResult<()> {
        if row.len() != self.cols {
            return Err(BowErr::Device(format!(
                "descriptor row has {} values, expected {}",
                row.len(),
                self.cols
            )));
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, i: usize) -> Option<&[T]> {
        if i >= self.rows {
            return None;
        }
        Some(&self.data[i * self.cols..(i + 1) * self.cols])
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks_exact(self.cols.max(1)).take(self.rows)
    }
}

/// A descriptor extraction backend.
///
/// An image without keypoints produces an empty matrix, which is a valid
/// result. Errors are reserved for failures that make further extraction
/// pointless (e.g. a lost device).
pub trait DescriptorExtractor {
    type Descriptor: Descriptor;

    fn extract(
        &mut self,
        image: &GrayImage,
    ) -> BowResult<DescriptorMatrix<<Self::Descriptor as Descriptor>::Component>>;
}

/// Load an image from disk as 8-bit grayscale.
pub fn load_gray<P: AsRef<Path>>(path: P) -> BowResult<GrayImage> {
    let path = path.as_ref();
    let decode_err = |reason: String| BowErr::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let img = image::ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .decode()
        .map_err(|e| decode_err(e.to_string()))?
        .to_luma8();
    if img.width() == 0 || img.height() == 0 {
        return Err(decode_err("image has no pixels".to_string()));
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_rows() {
        let mut m = DescriptorMatrix::<u8>::new(3);
        assert!(m.is_empty());
        m.push_row(&[1, 2, 3]).unwrap();
        m.push_row(&[4, 5, 6]).unwrap();
        assert!(m.push_row(&[7]).is_err());
        assert_eq!(m.rows(), 2);
        assert_eq!(m.row(1), Some(&[4u8, 5, 6][..]));
        assert_eq!(m.row(2), None);
        assert_eq!(m.iter_rows().count(), 2);
    }

    #[test]
    fn from_vec_checks_shape() {
        assert!(DescriptorMatrix::from_vec(2, 2, vec![0f32; 4]).is_ok());
        assert!(DescriptorMatrix::from_vec(2, 2, vec![0f32; 3]).is_err());
    }

    #[test]
    fn undecodable_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(matches!(load_gray(&path), Err(BowErr::Decode { .. })));
        assert!(matches!(
            load_gray(dir.path().join("missing.png")),
            Err(BowErr::Decode { .. })
        ));
    }
}
