use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{debug, info, trace};

use super::{nearest, Block, NodeId, Vocabulary};
use crate::{
    config::ClusteringConfig, BowErr, BowResult, CorpusDescriptorSet, Descriptor,
    VocabularyConfig,
};

/// A clustering engine turning a corpus into a vocabulary tree.
pub trait VocabularyBuilder<D: Descriptor> {
    fn build(
        &self,
        corpus: &CorpusDescriptorSet<D>,
        config: &VocabularyConfig,
    ) -> BowResult<Vocabulary<D>>;
}

/// Breadth-first hierarchical k-means with k-means++ seeding.
///
/// The random generator is seeded, so the same corpus and configuration
/// always produce the same tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchicalKMeans {
    pub seed: u64,
    /// Upper bound on Lloyd iterations per node.
    pub max_iterations: usize,
}

impl From<&ClusteringConfig> for HierarchicalKMeans {
    fn from(cfg: &ClusteringConfig) -> Self {
        Self {
            seed: cfg.seed,
            max_iterations: cfg.max_iterations,
        }
    }
}

impl Default for HierarchicalKMeans {
    fn default() -> Self {
        Self::from(&ClusteringConfig::default())
    }
}

/// A node waiting to be split.
struct Pending {
    block: usize,
    members: Vec<usize>,
    parent_ids: Vec<usize>,
    level: usize,
}

impl<D: Descriptor> VocabularyBuilder<D> for HierarchicalKMeans {
    fn build(
        &self,
        corpus: &CorpusDescriptorSet<D>,
        config: &VocabularyConfig,
    ) -> BowResult<Vocabulary<D>> {
        config.validate()?;
        let features: Vec<&D> = corpus.iter().flatten().collect();
        if features.is_empty() {
            return Err(BowErr::EmptyCorpus);
        }
        info!(
            "Clustering {} {} descriptors from {} images (k = {}, L = {})",
            features.len(),
            D::KIND.name(),
            corpus.len(),
            config.k,
            config.l
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut v = Vocabulary::empty(*config);
        let mut queue = VecDeque::new();
        queue.push_back(Pending {
            block: 0,
            members: (0..features.len()).collect(),
            parent_ids: vec![0],
            level: 1,
        });

        while let Some(node) = queue.pop_front() {
            trace!(
                "KMeans step with {} features. parents: {:?}, level {}",
                node.members.len(),
                node.parent_ids,
                node.level
            );
            let (centroids, groups) = self.cluster(&features, &node.members, config.k, &mut rng);
            let split = groups.len() > 1;

            let mut block = Block::new(node.block);
            for (centroid, group) in centroids.into_iter().zip(groups) {
                let leaf = node.level >= config.l || group.len() == 1 || !split;
                let id = v.next_node_id(leaf, &node.parent_ids);
                if let NodeId::Block(b) = id {
                    let mut parent_ids = node.parent_ids.clone();
                    parent_ids.push(b);
                    queue.push_back(Pending {
                        block: b,
                        members: group,
                        parent_ids,
                        level: node.level + 1,
                    });
                }
                // internal nodes carry no weight
                let weight = if leaf { 1. } else { 0. };
                block.children.push(centroid, weight, id);
            }
            if node.block == 0 {
                if let Some(root) = v.block_mut(0) {
                    *root = block;
                }
            } else {
                v.push_block(block);
            }
        }

        debug!(
            "Tree built: {} words, {} internal nodes",
            v.num_words(),
            v.num_internal_nodes()
        );
        v.reweight(corpus)?;
        Ok(v)
    }
}

impl HierarchicalKMeans {
    /// Split `members` into at most `k` non-empty groups.
    fn cluster<D: Descriptor>(
        &self,
        features: &[&D],
        members: &[usize],
        k: usize,
        rng: &mut StdRng,
    ) -> (Vec<D>, Vec<Vec<usize>>) {
        if members.len() <= k {
            // Only one feature per cluster
            let clusters = members.iter().map(|&i| features[i].clone()).collect();
            let groups = members.iter().map(|&i| vec![i]).collect();
            return (clusters, groups);
        }

        let mut clusters = initialize_clusters(features, members, k, rng);
        let mut assignment = vec![usize::MAX; members.len()];
        for iteration in 0..self.max_iterations.max(1) {
            let mut changed = false;
            for (slot, &i) in assignment.iter_mut().zip(members) {
                let best = nearest(&clusters, features[i]).unwrap_or(0);
                if *slot != best {
                    *slot = best;
                    changed = true;
                }
            }
            if !changed {
                trace!("converged after {} iterations", iteration);
                break; // converged
            }

            // update clusters
            let mut grouped: Vec<Vec<&D>> = vec![Vec::new(); clusters.len()];
            for (&c, &i) in assignment.iter().zip(members) {
                grouped[c].push(features[i]);
            }
            for (c, group) in clusters.iter_mut().zip(&grouped) {
                if !group.is_empty() {
                    *c = D::mean(group);
                }
            }
        }

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); clusters.len()];
        for (&c, &i) in assignment.iter().zip(members) {
            groups[c].push(i);
        }
        clusters
            .into_iter()
            .zip(groups)
            .filter(|(_, g)| !g.is_empty())
            .unzip()
    }
}

/// k-means++ seeding: each new center is drawn with probability proportional
/// to its squared distance from the closest center chosen so far. Stops early
/// when every member coincides with a center.
fn initialize_clusters<D: Descriptor>(
    features: &[&D],
    members: &[usize],
    k: usize,
    rng: &mut StdRng,
) -> Vec<D> {
    let mut clusters: Vec<D> = Vec::with_capacity(k);
    let first = members[rng.gen_range(0..members.len())];
    clusters.push(features[first].clone());
    let mut min_dist: Vec<f64> = members
        .iter()
        .map(|&i| features[i].distance(features[first]).powi(2))
        .collect();

    while clusters.len() < k {
        let total: f64 = min_dist.iter().sum();
        if total <= 0. {
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut pick = None;
        for (j, &d) in min_dist.iter().enumerate() {
            if target < d {
                pick = Some(j);
                break;
            }
            target -= d;
        }
        let pick = match pick.or_else(|| min_dist.iter().rposition(|&d| d > 0.)) {
            Some(p) => p,
            None => break,
        };
        let center = features[members[pick]].clone();
        for (d, &i) in min_dist.iter_mut().zip(members) {
            let nd = features[i].distance(&center).powi(2);
            if nd < *d {
                *d = nd;
            }
        }
        clusters.push(center);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::tests::{orb_corpus, sift_corpus};
    use crate::{OrbDesc, ScoringType, WeightingType};
    use proptest::prelude::*;

    fn config(k: usize, l: usize) -> VocabularyConfig {
        VocabularyConfig::new(k, l, WeightingType::TfIdf, ScoringType::L1Norm)
    }

    #[test]
    fn empty_corpus_is_an_error() {
        let corpus: CorpusDescriptorSet<OrbDesc> = vec![vec![], vec![]];
        let res = HierarchicalKMeans::default().build(&corpus, &config(2, 2));
        assert!(matches!(res, Err(BowErr::EmptyCorpus)));
    }

    #[test]
    fn invalid_shape_is_rejected() {
        let corpus = orb_corpus(1, 4, 0);
        let res = HierarchicalKMeans::default().build(&corpus, &config(1, 2));
        assert!(matches!(res, Err(BowErr::InvalidConfig(_))));
    }

    #[test]
    fn mixed_image_sizes_build() {
        // images with 5, 0 and 8 descriptors
        let mut corpus = orb_corpus(3, 8, 7);
        corpus[0].truncate(5);
        corpus[1].clear();
        let voc = HierarchicalKMeans::default()
            .build(&corpus, &config(2, 2))
            .unwrap();
        assert!(voc.num_words() <= 4);
        assert!(voc.depth() <= 2);
        voc.validate().unwrap();
    }

    #[test]
    fn same_seed_same_tree() {
        let corpus = sift_corpus(4, 25, 8);
        let engine = HierarchicalKMeans::default();
        let a = engine.build(&corpus, &config(3, 3)).unwrap();
        let b = engine.build(&corpus, &config(3, 3)).unwrap();
        assert!(a == b);
    }

    #[test]
    fn identical_descriptors_make_one_word() {
        let corpus: CorpusDescriptorSet<OrbDesc> = vec![vec![[7; 32]; 20]];
        let voc = HierarchicalKMeans::default()
            .build(&corpus, &config(3, 4))
            .unwrap();
        assert_eq!(voc.num_words(), 1);
        assert_eq!(voc.depth(), 1);
    }

    #[test]
    fn iteration_cap_still_yields_valid_tree() {
        let corpus = orb_corpus(4, 50, 9);
        let engine = HierarchicalKMeans {
            seed: 1,
            max_iterations: 1,
        };
        let voc = engine.build(&corpus, &config(4, 3)).unwrap();
        voc.validate().unwrap();
    }

    #[test]
    fn small_population_keeps_each_descriptor() {
        let features: Vec<OrbDesc> = vec![[1; 32], [2; 32], [3; 32]];
        let refs: Vec<&OrbDesc> = features.iter().collect();
        let mut rng = StdRng::seed_from_u64(0);
        let (clusters, groups) = HierarchicalKMeans::default().cluster(&refs, &[0, 1, 2], 3, &mut rng);
        assert_eq!(clusters, features);
        assert_eq!(groups, vec![vec![0], vec![1], vec![2]]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn tree_respects_shape_bounds(
            corpus in prop::collection::vec(
                prop::collection::vec(prop::array::uniform32(any::<u8>()), 0..24),
                1..5,
            ),
            k in 2usize..5,
            l in 1usize..4,
        ) {
            let total: usize = corpus.iter().map(Vec::len).sum();
            let res = HierarchicalKMeans::default().build(&corpus, &config(k, l));
            if total == 0 {
                prop_assert!(matches!(res, Err(BowErr::EmptyCorpus)));
            } else {
                let voc = res.unwrap();
                prop_assert!(voc.num_words() >= 1);
                prop_assert!(voc.num_words() <= k.pow(l as u32));
                prop_assert!(voc.num_words() <= total);
                prop_assert!(voc.depth() <= l);
                prop_assert!(voc.validate().is_ok());
                prop_assert!(voc.word_weights().iter().all(|w| w.is_finite() && *w >= 0.));
            }
        }
    }
}
