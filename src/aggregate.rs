use crate::{BowErr, BowResult, Descriptor, DescriptorMatrix};

/// Descriptors of one image. Order within an image is irrelevant.
pub type ImageDescriptorSet<D> = Vec<D>;

/// Per-image descriptor sets in corpus order. Each entry is one document
/// for the weighting statistics, so images are never merged.
pub type CorpusDescriptorSet<D> = Vec<ImageDescriptorSet<D>>;

/// Turn each row of a raw descriptor matrix into one descriptor.
pub fn image_set<D: Descriptor>(
    matrix: &DescriptorMatrix<D::Component>,
) -> BowResult<ImageDescriptorSet<D>> {
    if matrix.cols() != D::LEN {
        return Err(BowErr::ConfigMismatch {
            expected: D::KIND.to_string(),
            found: format!("matrix with {} columns", matrix.cols()),
        });
    }
    matrix
        .iter_rows()
        .map(|row| {
            D::from_row(row).ok_or_else(|| BowErr::ConfigMismatch {
                expected: D::KIND.to_string(),
                found: format!("row with {} components", row.len()),
            })
        })
        .collect()
}

/// Reassemble per-image results, tagged with their corpus index, in corpus order.
///
/// Indices must be exactly `0..n`, each present once.
pub fn aggregate<D: Descriptor>(
    mut tagged: Vec<(usize, ImageDescriptorSet<D>)>,
) -> BowResult<CorpusDescriptorSet<D>> {
    tagged.sort_by_key(|(i, _)| *i);
    for (expected, (i, _)) in tagged.iter().enumerate() {
        if *i != expected {
            return Err(BowErr::InvalidConfig(format!(
                "descriptor set for image {} is missing or duplicated",
                expected
            )));
        }
    }
    Ok(tagged.into_iter().map(|(_, set)| set).collect())
}

/// Total number of descriptors over all images.
pub fn descriptor_count<D>(corpus: &CorpusDescriptorSet<D>) -> usize {
    corpus.iter().map(Vec::len).sum()
}
