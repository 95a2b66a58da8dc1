use serde::{Deserialize, Serialize};
use smallvec::ToSmallVec;
use std::fmt;

use crate::bow::WordPath;
use crate::*;

/// Hierarchical k-means construction of the tree.
pub mod builder;
pub use builder::{HierarchicalKMeans, VocabularyBuilder};

/// Compressed binary artifact.
#[cfg(feature = "bincode")]
pub mod store;
#[cfg(feature = "bincode")]
pub use store::peek_kind;

/// DBoW2-compatible plain text format.
pub mod text;

#[derive(Serialize, Deserialize, PartialEq, Clone)]
#[serde(bound = "D: Descriptor")]
/// Feature vocabulary built from a collection of image keypoint descriptors. Can be:
/// 1. Created from a corpus through a [`VocabularyBuilder`].
/// 2. Saved to a file & loaded from a file, as a compressed binary artifact
///    (requires bincode feature, enabled by default) or as DBoW2 text.
/// 3. Used to transform a new set of descriptors into a BoW representation (and
///    optionally get DirectIndex from features to nodes).
pub struct Vocabulary<D> {
    config: VocabularyConfig,
    blocks: Vec<Block<D>>,
    num_blocks: usize,
    num_leaves: usize,
}

/// Vocabulary API
impl<D: Descriptor> Vocabulary<D> {
    /// Build a vocabulary from a corpus with the default clustering engine.
    pub fn create(corpus: &CorpusDescriptorSet<D>, config: VocabularyConfig) -> BowResult<Self> {
        HierarchicalKMeans::default().build(corpus, &config)
    }

    /// Transform a set of descriptors into its bag of words representation
    /// with respect to the Vocabulary, weighted by the vocabulary's weighting
    /// scheme and normalized for its scoring scheme.
    pub fn transform(&self, features: &[D]) -> BowResult<BoW> {
        self.transform_generic(features, false).map(|(bow, _)| bow)
    }

    /// Same as [`Vocabulary::transform`], also providing the "direct index"
    /// from the features to their corresponding nodes in the Vocabulary tree.
    ///
    /// The direct index for `feature[i]` is `di = DirectIdx[i]` where
    /// `di.len() <= l` (number of levels), and `di[j]` is the id of the node matching `feature[i]`
    /// at level `j` in the Vocabulary tree. The last entry is the word id.
    pub fn transform_with_direct_idx(&self, features: &[D]) -> BowResult<(BoW, DirectIdx)> {
        self.transform_generic(features, true)
    }

    /// Recompute leaf weights from a corpus, one document per image.
    ///
    /// With IDF weighting a word seen in `n_i` of `N` images gets `ln(N / n_i)`
    /// and a word no image reaches gets 0. Otherwise every word weighs 1.
    pub fn reweight(&mut self, corpus: &CorpusDescriptorSet<D>) -> BowResult<()> {
        let weighting = self.config.weighting;
        let mut doc_freq = vec![0usize; self.num_leaves];
        if weighting.uses_idf() {
            let mut last_seen = vec![usize::MAX; self.num_leaves];
            for (image, set) in corpus.iter().enumerate() {
                for feature in set {
                    let (word, _, _) = self.quantize(feature)?;
                    if last_seen[word] != image {
                        last_seen[word] = image;
                        doc_freq[word] += 1;
                    }
                }
            }
        }

        let n_docs = corpus.len() as f64;
        for block in self.blocks.iter_mut() {
            let children = &mut block.children;
            for (id, w) in children.ids.iter().zip(children.weights.iter_mut()) {
                let word = match id {
                    NodeId::Leaf(path) => path.last().copied(),
                    NodeId::Block(_) => None,
                };
                match (word, weighting.uses_idf()) {
                    (Some(word), true) => {
                        *w = match doc_freq.get(word) {
                            Some(&n) if n > 0 => (n_docs / n as f64).ln() as f32,
                            _ => 0.,
                        };
                    }
                    (Some(_), false) => *w = 1.,
                    (None, _) => {}
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &VocabularyConfig {
        &self.config
    }

    /// Number of visual words (leaves).
    pub fn num_words(&self) -> usize {
        self.num_leaves
    }

    /// Number of internal nodes, root included.
    pub fn num_internal_nodes(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_leaves == 0
    }

    /// Weight of every word, indexed by word id.
    pub fn word_weights(&self) -> Vec<f32> {
        let mut weights = vec![0.; self.num_leaves];
        self.for_each_leaf(|word, _, w| {
            if let Some(slot) = weights.get_mut(word) {
                *slot = w;
            }
        });
        weights
    }

    /// Centroid of a word.
    pub fn word(&self, id: WordId) -> Option<&D> {
        let mut found = None;
        self.for_each_leaf(|word, d, _| {
            if word == id {
                found = Some(d);
            }
        });
        found
    }

    /// Number of levels below the root actually used.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        for block in &self.blocks {
            for id in &block.children.ids {
                if let NodeId::Leaf(path) = id {
                    depth = depth.max(path.len());
                }
            }
        }
        depth
    }

    pub fn report(&self) -> Report {
        Report {
            descriptor: D::KIND,
            words: self.num_leaves,
            internal_nodes: self.blocks.len(),
            depth: self.depth(),
            k: self.config.k,
            l: self.config.l,
            weighting: self.config.weighting,
            scoring: self.config.scoring,
        }
    }
}

/// Summary statistics of a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub descriptor: DescriptorKind,
    pub words: usize,
    pub internal_nodes: usize,
    pub depth: usize,
    pub k: usize,
    pub l: usize,
    pub weighting: WeightingType,
    pub scoring: ScoringType,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Vocabulary: k = {}, L = {}, Weighting = {}, Scoring = {}, Number of words = {}",
            self.k, self.l, self.weighting, self.scoring, self.words
        )?;
        write!(
            f,
            "Descriptor: {}, internal nodes = {}, depth = {}",
            self.descriptor, self.internal_nodes, self.depth
        )
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(bound = "D: Descriptor")]
/// A unit representing a non-leaf node in the vocabulary
pub(crate) struct Block<D> {
    pub(crate) id: usize,
    pub(crate) children: Children<D>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
#[serde(bound = "D: Descriptor")]
/// Data structure representing the child nodes of a block, which may
/// or may not be leaves
pub(crate) struct Children<D> {
    pub(crate) features: Vec<D>,
    pub(crate) weights: Vec<f32>,
    pub(crate) ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
/// Unique identifier for a node. The Leaf variant stores ids of all its parents,
/// which is equivalent to the DirectIndex for any feature matching that leaf.
pub(crate) enum NodeId {
    Block(usize),
    Leaf(WordPath),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum SerializableNodeId {
    Block(usize),
    Leaf(Vec<usize>),
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let ser = match self {
            NodeId::Block(id) => SerializableNodeId::Block(*id),
            NodeId::Leaf(l_id) => SerializableNodeId::Leaf(l_id.to_vec()),
        };

        ser.serialize(serializer)
    }
}
impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<De>(deserializer: De) -> Result<Self, De::Error>
    where
        De: serde::Deserializer<'de>,
    {
        let ser = SerializableNodeId::deserialize(deserializer)?;

        Ok(match ser {
            SerializableNodeId::Block(id) => NodeId::Block(id),
            SerializableNodeId::Leaf(l_id) => NodeId::Leaf(l_id.to_smallvec()),
        })
    }
}

impl<D> Block<D> {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            children: Children {
                features: Vec::new(),
                weights: Vec::new(),
                ids: Vec::new(),
            },
        }
    }
}

impl<D> Children<D> {
    pub(crate) fn push(&mut self, feature: D, weight: f32, id: NodeId) {
        self.features.push(feature);
        self.weights.push(weight);
        self.ids.push(id);
    }
}

/// Index of the centroid closest to `feature`. Ties go to the lower index.
pub(crate) fn nearest<D: Descriptor>(centroids: &[D], feature: &D) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, c) in centroids.iter().enumerate() {
        let d = feature.distance(c);
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i)
}

impl<D: Descriptor> Vocabulary<D> {
    fn transform_generic(&self, features: &[D], di: bool) -> BowResult<(BoW, DirectIdx)> {
        let mut bow = BoW::new();
        let mut direct_idx: DirectIdx = Vec::with_capacity(if di { features.len() } else { 0 });
        if self.blocks.is_empty() {
            return Ok((bow, direct_idx));
        }
        let weighting = self.config.weighting;
        for feature in features {
            let (word_id, weight, path) = self.quantize(feature)?;
            if di {
                // add word parent ids to direct index
                direct_idx.push(path.clone());
            }
            if weight > 0. {
                if weighting.uses_tf() {
                    *bow.entry(word_id).or_insert(0.) += weight;
                } else {
                    bow.entry(word_id).or_insert(weight);
                }
            }
        }
        if weighting.uses_tf() && !features.is_empty() {
            let inv_n = 1. / features.len() as f32;
            for w in bow.values_mut() {
                *w *= inv_n;
            }
        }
        bow.normalize(self.config.scoring);

        Ok((bow, direct_idx))
    }

    /// Descend the tree to the word closest to `feature`.
    fn quantize(&self, feature: &D) -> BowResult<(WordId, f32, &WordPath)> {
        // start at root block
        let mut block = self
            .blocks
            .first()
            .ok_or_else(|| BowErr::Format("vocabulary has no nodes".to_string()))?;

        loop {
            let best = nearest(&block.children.features, feature).ok_or_else(|| {
                BowErr::Format(format!("internal node {} has no children", block.id))
            })?;
            match &block.children.ids[best] {
                NodeId::Block(id) => {
                    block = self.blocks.get(*id).ok_or_else(|| {
                        BowErr::Format(format!("reference to missing node {}", id))
                    })?;
                }
                NodeId::Leaf(ids) => {
                    let word_id = *ids
                        .last()
                        .ok_or_else(|| BowErr::Format("word without an id".to_string()))?;
                    return Ok((word_id, block.children.weights[best], ids));
                }
            }
        }
    }

    fn for_each_leaf<'a>(&'a self, mut f: impl FnMut(WordId, &'a D, f32)) {
        for block in &self.blocks {
            let c = &block.children;
            for ((id, d), &w) in c.ids.iter().zip(&c.features).zip(&c.weights) {
                if let NodeId::Leaf(path) = id {
                    if let Some(&word) = path.last() {
                        f(word, d, w);
                    }
                }
            }
        }
    }

    /// Provide the next NodeId, either leaf/word or block.
    pub(crate) fn next_node_id(&mut self, leaf: bool, parent_ids: &[usize]) -> NodeId {
        match leaf {
            true => {
                // Leaf node will hold the block ids of its parents in addition to leaf id, to facilitate getting direct index later
                let mut new_parent_ids: WordPath = parent_ids[1..].to_smallvec(); // Clone ids but drop the first parent which is always 0
                new_parent_ids.push(self.num_leaves); // Add leaf id
                self.num_leaves += 1;
                NodeId::Leaf(new_parent_ids)
            }
            false => {
                self.num_blocks += 1;
                NodeId::Block(self.num_blocks)
            }
        }
    }

    /// A tree holding only an empty root block.
    pub(crate) fn empty(config: VocabularyConfig) -> Self {
        Self {
            config,
            blocks: vec![Block::new(0)],
            num_blocks: 0,
            num_leaves: 0,
        }
    }

    pub(crate) fn push_block(&mut self, block: Block<D>) {
        self.blocks.push(block);
    }

    pub(crate) fn block_mut(&mut self, id: usize) -> Option<&mut Block<D>> {
        self.blocks.get_mut(id)
    }

    pub(crate) fn blocks(&self) -> &[Block<D>] {
        &self.blocks
    }

    /// Structural check of a deserialized tree.
    pub(crate) fn validate(&self) -> BowResult<()> {
        let bad = |msg: String| Err(BowErr::Format(msg));
        self.config
            .validate()
            .map_err(|e| BowErr::Format(e.to_string()))?;
        if self.num_leaves == 0 {
            return bad("vocabulary has no words".to_string());
        }
        if self.blocks.len().checked_sub(1) != Some(self.num_blocks) {
            return bad(format!(
                "{} internal nodes stored, {} declared after the root",
                self.blocks.len(),
                self.num_blocks
            ));
        }
        let stored_leaves = self
            .blocks
            .iter()
            .flat_map(|b| b.children.ids.iter())
            .filter(|id| matches!(id, NodeId::Leaf(_)))
            .count();
        if stored_leaves != self.num_leaves {
            return bad(format!(
                "{} words stored, {} declared",
                stored_leaves, self.num_leaves
            ));
        }

        let mut block_paths: Vec<Option<Vec<usize>>> = vec![None; self.blocks.len()];
        block_paths[0] = Some(Vec::new());
        let mut leaf_seen = vec![false; self.num_leaves];
        for (i, block) in self.blocks.iter().enumerate() {
            if block.id != i {
                return bad(format!("internal node {} stored at position {}", block.id, i));
            }
            let path = match &block_paths[i] {
                Some(p) => p.clone(),
                None => return bad(format!("internal node {} is unreachable", i)),
            };
            let c = &block.children;
            let n = c.ids.len();
            if n == 0 || n > self.config.k || c.features.len() != n || c.weights.len() != n {
                return bad(format!("internal node {} has malformed children", i));
            }
            for id in &c.ids {
                match id {
                    NodeId::Block(b) => {
                        if *b <= i || *b >= self.blocks.len() || block_paths[*b].is_some() {
                            return bad(format!("internal node {} has invalid child {}", i, b));
                        }
                        let mut p = path.clone();
                        p.push(*b);
                        block_paths[*b] = Some(p);
                    }
                    NodeId::Leaf(word_path) => {
                        let (word, parents) = match word_path.split_last() {
                            Some((&w, parents)) => (w, parents),
                            None => return bad("word without an id".to_string()),
                        };
                        if parents != path.as_slice() || word_path.len() > self.config.l {
                            return bad(format!("word {} has an inconsistent path", word));
                        }
                        match leaf_seen.get_mut(word) {
                            Some(seen) if !*seen => *seen = true,
                            _ => return bad(format!("invalid or duplicated word id {}", word)),
                        }
                    }
                }
            }
        }
        if leaf_seen.iter().any(|s| !s) {
            return bad("word ids are not contiguous".to_string());
        }
        Ok(())
    }
}

impl<D> fmt::Debug for Children<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Children")
            .field("ids", &self.ids)
            .field("weights", &self.weights)
            .finish()
    }
}

impl<D: Descriptor> fmt::Debug for Vocabulary<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("Descriptor", &D::KIND)
            .field("Word/Leaf Nodes", &self.num_leaves)
            .field("Other Nodes", &self.num_blocks)
            .field("Levels", &self.config.l)
            .field("Depth", &self.depth())
            .field("Branching Factor", &self.config.k)
            .field("Weighting", &self.config.weighting)
            .field("Scoring", &self.config.scoring)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Images whose descriptors cluster around a few random binary centers.
    pub(crate) fn orb_corpus(images: usize, per_image: usize, seed: u64) -> CorpusDescriptorSet<OrbDesc> {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers: Vec<OrbDesc> = (0..6).map(|_| rng.gen()).collect();
        (0..images)
            .map(|_| {
                (0..per_image)
                    .map(|_| {
                        let mut d = centers[rng.gen_range(0..centers.len())];
                        d[rng.gen_range(0..32)] ^= 1 << rng.gen_range(0..8);
                        d
                    })
                    .collect()
            })
            .collect()
    }

    pub(crate) fn sift_corpus(images: usize, per_image: usize, seed: u64) -> CorpusDescriptorSet<SiftDesc> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..images)
            .map(|_| {
                (0..per_image)
                    .map(|_| {
                        let mut d = SiftDesc::zeros();
                        for v in d.0.iter_mut() {
                            *v = rng.gen::<f32>();
                        }
                        d
                    })
                    .collect()
            })
            .collect()
    }

    fn config(k: usize, l: usize, weighting: WeightingType) -> VocabularyConfig {
        VocabularyConfig::new(k, l, weighting, ScoringType::L1Norm)
    }

    #[test]
    fn transform_is_l1_normalized() {
        let corpus = orb_corpus(6, 40, 1);
        let voc = Vocabulary::create(&corpus, config(3, 3, WeightingType::Tf)).unwrap();
        voc.validate().unwrap();
        let bow = voc.transform(&corpus[0]).unwrap();
        let sum: f32 = bow.values().sum();
        assert!((sum - 1.).abs() < 1e-5);
        assert!(bow.keys().all(|&w| w < voc.num_words()));
    }

    #[test]
    fn direct_index_ends_with_word() {
        let corpus = orb_corpus(4, 30, 2);
        let voc = Vocabulary::create(&corpus, config(2, 4, WeightingType::TfIdf)).unwrap();
        let (bow, di) = voc.transform_with_direct_idx(&corpus[1]).unwrap();
        assert_eq!(di.len(), corpus[1].len());
        for path in &di {
            assert!(path.len() <= 4);
            let word = *path.last().unwrap();
            assert!(word < voc.num_words());
        }
        // every word with a positive weight shows up in the BoW
        let weights = voc.word_weights();
        for path in &di {
            let word = *path.last().unwrap();
            assert_eq!(bow.contains_key(&word), weights[word] > 0.);
        }
    }

    #[test]
    fn same_image_scores_best() {
        let corpus = orb_corpus(5, 50, 3);
        let voc = Vocabulary::create(&corpus, config(4, 2, WeightingType::Tf)).unwrap();
        let a = voc.transform(&corpus[0]).unwrap();
        let b = voc.transform(&corpus[3]).unwrap();
        assert!((a.l1(&a) - 1.).abs() < 1e-5);
        assert!(a.l1(&b) <= 1.);
    }

    #[test]
    fn idf_weights_follow_document_frequency() {
        // Three images, each descriptor distinct: every word is seen in one image.
        let corpus: CorpusDescriptorSet<OrbDesc> = vec![vec![[0; 32]], vec![[0xFF; 32]], vec![[0x0F; 32]]];
        let voc = Vocabulary::create(&corpus, config(4, 2, WeightingType::TfIdf)).unwrap();
        assert_eq!(voc.num_words(), 3);
        for w in voc.word_weights() {
            assert!((w - 3f32.ln()).abs() < 1e-6);
        }
    }

    #[test]
    fn word_in_every_image_is_ignored_by_idf() {
        let corpus: CorpusDescriptorSet<OrbDesc> = vec![vec![[0; 32], [0xFF; 32]], vec![[0; 32]]];
        let voc = Vocabulary::create(&corpus, config(2, 1, WeightingType::Idf)).unwrap();
        let zero_word = voc.transform_with_direct_idx(&[[0; 32]]).unwrap().1[0][0];
        assert_eq!(voc.word_weights()[zero_word], 0.);
        assert!(voc.transform(&[[0; 32]]).unwrap().is_empty());
        assert_eq!(voc.transform(&[[0xFF; 32]]).unwrap().len(), 1);
    }

    #[test]
    fn reweight_switches_to_unit_weights() {
        let corpus = orb_corpus(3, 20, 4);
        let mut voc = Vocabulary::create(&corpus, config(3, 2, WeightingType::Binary)).unwrap();
        assert!(voc.word_weights().iter().all(|&w| w == 1.));
        voc.config.weighting = WeightingType::TfIdf;
        voc.reweight(&corpus).unwrap();
        assert!(voc.word_weights().iter().all(|&w| w >= 0. && w.is_finite()));
    }

    #[test]
    fn reweight_drops_words_missing_from_new_corpus() {
        let corpus: CorpusDescriptorSet<OrbDesc> =
            vec![vec![[0; 32]], vec![[0xFF; 32]], vec![[0x0F; 32]], vec![[0xF0; 32]]];
        let mut voc = Vocabulary::create(&corpus, config(4, 1, WeightingType::TfIdf)).unwrap();
        assert!(voc.word_weights().iter().all(|w| (w - 4f32.ln()).abs() < 1e-6));

        voc.reweight(&vec![vec![[0; 32]], vec![[0xFF; 32]]]).unwrap();
        let weights = voc.word_weights();
        let zero = voc.transform_with_direct_idx(&[[0; 32]]).unwrap().1[0][0];
        let ones = voc.transform_with_direct_idx(&[[0xFF; 32]]).unwrap().1[0][0];
        for (word, w) in weights.iter().enumerate() {
            if word == zero || word == ones {
                assert!((w - 2f32.ln()).abs() < 1e-6);
            } else {
                assert_eq!(*w, 0.);
            }
        }
    }

    #[test]
    fn unreachable_duplicate_word_weighs_nothing() {
        let corpus: CorpusDescriptorSet<OrbDesc> = vec![vec![[1; 32], [1; 32]], vec![[2; 32]]];
        let voc = Vocabulary::create(&corpus, config(3, 1, WeightingType::TfIdf)).unwrap();
        let weights = voc.word_weights();
        assert_eq!(weights.len(), 3);
        assert_eq!(weights.iter().filter(|&&w| w == 0.).count(), 1);
        assert!(weights.iter().all(|&w| w <= 2f32.ln() + 1e-6));
    }

    #[test]
    fn report_describes_tree() {
        let corpus = sift_corpus(3, 30, 5);
        let voc = Vocabulary::create(&corpus, VocabularyConfig::default_for(DescriptorKind::Sift)).unwrap();
        let report = voc.report();
        assert_eq!(report.descriptor, DescriptorKind::Sift);
        assert_eq!(report.words, voc.num_words());
        assert_eq!(report.internal_nodes, voc.num_internal_nodes());
        assert!(report.depth <= 6);
        let text = report.to_string();
        assert!(text.contains("Scoring = L2-norm"));
        assert!(text.contains(&format!("Number of words = {}", voc.num_words())));
    }

    #[test]
    fn word_lookup() {
        let corpus: CorpusDescriptorSet<OrbDesc> = vec![vec![[1; 32], [2; 32]]];
        let voc = Vocabulary::create(&corpus, config(2, 1, WeightingType::Tf)).unwrap();
        assert_eq!(voc.word(0), Some(&[1; 32]));
        assert_eq!(voc.word(1), Some(&[2; 32]));
        assert_eq!(voc.word(2), None);
    }

    #[test]
    fn validate_rejects_broken_trees() {
        let corpus = orb_corpus(3, 20, 6);
        let voc = Vocabulary::create(&corpus, config(3, 2, WeightingType::Tf)).unwrap();

        let mut dup = voc.clone();
        dup.num_leaves += 1;
        assert!(matches!(dup.validate(), Err(BowErr::Format(_))));

        let mut huge = voc.clone();
        huge.num_leaves = usize::MAX;
        assert!(matches!(huge.validate(), Err(BowErr::Format(_))));

        let mut blocks = voc.clone();
        blocks.num_blocks = usize::MAX;
        assert!(matches!(blocks.validate(), Err(BowErr::Format(_))));

        let mut cut = voc.clone();
        cut.blocks[0].children.weights.pop();
        assert!(matches!(cut.validate(), Err(BowErr::Format(_))));
    }
}
