use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{
    aggregate::{aggregate, descriptor_count, image_set},
    extract::load_gray,
    BowErr, BowResult, Corpus, CorpusDescriptorSet, Descriptor, DescriptorExtractor,
    DescriptorKind, HierarchicalKMeans, ImageDescriptorSet, PipelineConfig, Vocabulary,
    VocabularyBuilder,
};

/// Per-image extraction progress.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    /// Position of the image in the corpus, starting at 0.
    pub index: usize,
    pub total: usize,
    pub path: &'a Path,
    pub descriptors: usize,
}

/// Where a build over `root` stores its vocabulary.
pub fn vocabulary_path<P: AsRef<Path>>(root: P, kind: DescriptorKind) -> PathBuf {
    root.as_ref()
        .join(format!("{}_vocabulary.voc", kind.name()))
}

/// Corpus scan, descriptor extraction and vocabulary construction for one
/// extraction backend.
pub struct Pipeline<E> {
    extractor: E,
    config: PipelineConfig,
}

impl<E: DescriptorExtractor> Pipeline<E> {
    pub fn new(extractor: E, config: PipelineConfig) -> BowResult<Self> {
        config.validate()?;
        if config.descriptor != E::Descriptor::KIND {
            return Err(BowErr::ConfigMismatch {
                expected: config.descriptor.to_string(),
                found: E::Descriptor::KIND.to_string(),
            });
        }
        Ok(Self { extractor, config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn scan<P: AsRef<Path>>(&self, root: P) -> BowResult<Corpus> {
        let corpus = Corpus::scan(root, &self.config.scan)?;
        info!(
            "Found {} images under {}",
            corpus.len(),
            corpus.root().display()
        );
        Ok(corpus)
    }

    /// Extract descriptors image by image, in corpus order.
    pub fn extract_corpus<F>(
        &mut self,
        corpus: &Corpus,
        mut progress: F,
    ) -> BowResult<CorpusDescriptorSet<E::Descriptor>>
    where
        F: FnMut(Progress<'_>),
    {
        let total = corpus.len();
        let mut sets = Vec::with_capacity(total);
        for (index, path) in corpus.iter().enumerate() {
            let set = process(&mut self.extractor, path)?;
            progress(Progress {
                index,
                total,
                path,
                descriptors: set.len(),
            });
            sets.push(set);
        }
        Ok(sets)
    }

    /// Reject corpora that produced too few descriptors to cluster.
    pub fn check_corpus(&self, sets: &CorpusDescriptorSet<E::Descriptor>) -> BowResult<usize> {
        let found = descriptor_count(sets);
        info!("Extracted {} descriptors from {} images", found, sets.len());
        if found < self.config.min_descriptors {
            return Err(BowErr::InsufficientDescriptors {
                found,
                required: self.config.min_descriptors,
                images: sets.len(),
            });
        }
        Ok(found)
    }

    /// Check the corpus and cluster it into a vocabulary.
    pub fn build(
        &self,
        sets: &CorpusDescriptorSet<E::Descriptor>,
    ) -> BowResult<Vocabulary<E::Descriptor>> {
        self.check_corpus(sets)?;
        let config = self.config.vocabulary_config();
        HierarchicalKMeans::from(&self.config.clustering).build(sets, &config)
    }

    /// Scan, extract sequentially and build.
    pub fn run<P, F>(&mut self, root: P, progress: F) -> BowResult<Vocabulary<E::Descriptor>>
    where
        P: AsRef<Path>,
        F: FnMut(Progress<'_>),
    {
        let corpus = self.scan(root)?;
        let sets = self.extract_corpus(&corpus, progress)?;
        self.build(&sets)
    }
}

impl<E> Pipeline<E>
where
    E: DescriptorExtractor + Clone + Send + Sync,
{
    /// Extract on a pool of `jobs` threads, each owning a clone of the extractor.
    pub fn extract_parallel<F>(
        &self,
        corpus: &Corpus,
        progress: F,
    ) -> BowResult<CorpusDescriptorSet<E::Descriptor>>
    where
        F: Fn(Progress<'_>) + Send + Sync,
    {
        let total = corpus.len();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs.max(1))
            .build()?;
        debug!("Extracting on {} threads", pool.current_num_threads());
        let tagged = pool.install(|| {
            corpus
                .paths()
                .par_iter()
                .enumerate()
                .map_init(
                    || self.extractor.clone(),
                    |extractor, (index, path)| {
                        let set = process(extractor, path)?;
                        progress(Progress {
                            index,
                            total,
                            path,
                            descriptors: set.len(),
                        });
                        Ok((index, set))
                    },
                )
                .collect::<BowResult<Vec<_>>>()
        })?;
        aggregate(tagged)
    }

    /// Scan, extract in parallel and build.
    pub fn run_parallel<P, F>(&self, root: P, progress: F) -> BowResult<Vocabulary<E::Descriptor>>
    where
        P: AsRef<Path>,
        F: Fn(Progress<'_>) + Send + Sync,
    {
        let corpus = self.scan(root)?;
        let sets = self.extract_parallel(&corpus, progress)?;
        self.build(&sets)
    }
}

/// Decode one image and extract its descriptors. Undecodable images
/// contribute an empty set.
fn process<E: DescriptorExtractor>(
    extractor: &mut E,
    path: &Path,
) -> BowResult<ImageDescriptorSet<E::Descriptor>> {
    let image = match load_gray(path) {
        Ok(image) => image,
        Err(e @ BowErr::Decode { .. }) => {
            warn!("{}, skipping", e);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let matrix = extractor.extract(&image)?;
    image_set(&matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrbExtractor, SiftExtractor};
    use crate::extract::HostSiftDevice;

    #[test]
    fn output_path_names_descriptor() {
        assert_eq!(
            vocabulary_path("/data/images", DescriptorKind::Orb),
            PathBuf::from("/data/images/orb_vocabulary.voc")
        );
        assert_eq!(
            vocabulary_path("imgs", DescriptorKind::Sift),
            PathBuf::from("imgs/sift_vocabulary.voc")
        );
    }

    #[test]
    fn extractor_must_match_configured_descriptor() {
        let config = PipelineConfig {
            descriptor: DescriptorKind::Orb,
            ..PipelineConfig::default()
        };
        let sift = SiftExtractor::new(HostSiftDevice::new(), config.sift.clone());
        assert!(matches!(
            Pipeline::new(sift, config),
            Err(BowErr::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn too_few_descriptors_is_reported() {
        let pipeline = Pipeline::new(OrbExtractor::default(), PipelineConfig::default()).unwrap();
        let sets: CorpusDescriptorSet<crate::OrbDesc> = vec![vec![[0; 32]; 10], vec![]];
        match pipeline.build(&sets) {
            Err(BowErr::InsufficientDescriptors {
                found,
                required,
                images,
            }) => assert_eq!((found, required, images), (10, 1000, 2)),
            other => panic!("unexpected {:?}", other.map(|v| v.report())),
        }
    }

    #[test]
    fn undecodable_file_contributes_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        let set = process(&mut OrbExtractor::default(), &path).unwrap();
        assert!(set.is_empty());
    }
}
