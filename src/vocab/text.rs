//! Plain text vocabulary in the DBoW2 layout.
//!
//! The first line holds `k L scoring weighting` (numeric codes). Every other
//! line describes one node, breadth-first from the root's children:
//! `parent_node is_leaf <descriptor components> weight`, where nodes are
//! numbered by line with the root as node 0.

use atomic_write_file::AtomicWriteFile;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use super::{Block, NodeId, Vocabulary};
use crate::{BowErr, BowResult, Descriptor, ScoringType, VocabularyConfig, WeightingType};

impl<D: Descriptor> Vocabulary<D> {
    /// Save the vocabulary as text.
    pub fn save_txt<P: AsRef<Path>>(&self, file: P) -> BowResult<()> {
        let mut file = AtomicWriteFile::open(file.as_ref())?;
        {
            let mut w = BufWriter::new(file.as_file_mut());
            writeln!(
                w,
                "{} {} {} {}",
                self.config.k,
                self.config.l,
                self.config.scoring.code(),
                self.config.weighting.code()
            )?;

            let mut node_of_block = vec![0usize; self.blocks().len()];
            let mut next_node = 1;
            for block in self.blocks() {
                let parent = node_of_block[block.id];
                let c = &block.children;
                for ((id, feature), weight) in c.ids.iter().zip(&c.features).zip(&c.weights) {
                    let is_leaf = matches!(id, NodeId::Leaf(_));
                    writeln!(
                        w,
                        "{} {} {} {}",
                        parent,
                        is_leaf as u8,
                        feature.to_text(),
                        weight
                    )?;
                    if let NodeId::Block(b) = id {
                        if let Some(slot) = node_of_block.get_mut(*b) {
                            *slot = next_node;
                        }
                    }
                    next_node += 1;
                }
            }
            w.flush()?;
        }
        file.commit()?;
        Ok(())
    }

    /// Load a vocabulary from text.
    ///
    /// A node line whose component count differs from `D::LEN` means the file
    /// holds another descriptor family and is reported as a mismatch.
    pub fn load_txt<P: AsRef<Path>>(file: P) -> BowResult<Self> {
        let reader = BufReader::new(File::open(file.as_ref())?);
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| BowErr::Format("empty vocabulary file".to_string()))??;
        let config = parse_header(&header)?;

        let mut v = Self::empty(config);
        // node id -> internal node id, `None` for words
        let mut node_block: Vec<Option<usize>> = vec![Some(0)];
        // internal node id -> ids of the internal nodes above it, root included
        let mut block_parents: Vec<Vec<usize>> = vec![vec![0]];

        for (n, line) in lines.enumerate() {
            let line = line?;
            let lineno = n + 2;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 4 {
                return Err(BowErr::Format(format!("line {} is too short", lineno)));
            }
            let parent: usize = fields[0]
                .parse()
                .map_err(|_| BowErr::Format(format!("line {}: bad parent id", lineno)))?;
            let is_leaf = match fields[1] {
                "0" => false,
                "1" => true,
                other => {
                    return Err(BowErr::Format(format!(
                        "line {}: bad leaf flag '{}'",
                        lineno, other
                    )))
                }
            };
            let components = &fields[2..fields.len() - 1];
            if components.len() != D::LEN {
                return Err(BowErr::ConfigMismatch {
                    expected: D::KIND.to_string(),
                    found: format!("{} components on line {}", components.len(), lineno),
                });
            }
            let feature = D::from_text(components)
                .ok_or_else(|| BowErr::Format(format!("line {}: bad descriptor", lineno)))?;
            let weight: f32 = fields[fields.len() - 1]
                .parse()
                .map_err(|_| BowErr::Format(format!("line {}: bad weight", lineno)))?;

            let block = node_block.get(parent).copied().flatten().ok_or_else(|| {
                BowErr::Format(format!(
                    "line {}: parent {} is not a known internal node",
                    lineno, parent
                ))
            })?;
            let parent_ids = block_parents[block].clone();
            let id = v.next_node_id(is_leaf, &parent_ids);
            match &id {
                NodeId::Block(b) => {
                    node_block.push(Some(*b));
                    let mut ids = parent_ids;
                    ids.push(*b);
                    block_parents.push(ids);
                    v.push_block(Block::new(*b));
                }
                NodeId::Leaf(_) => node_block.push(None),
            }
            let children = &mut v
                .block_mut(block)
                .ok_or_else(|| BowErr::Format(format!("line {}: dangling parent", lineno)))?
                .children;
            if children.ids.len() >= config.k {
                return Err(BowErr::Format(format!(
                    "node {} has more than k = {} children",
                    parent, config.k
                )));
            }
            children.push(feature, weight, id);
        }

        v.validate()?;
        Ok(v)
    }
}

fn parse_header(line: &str) -> BowResult<VocabularyConfig> {
    let bad = || BowErr::Format(format!("bad vocabulary header '{}'", line.trim()));
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(bad());
    }
    let k: usize = fields[0].parse().map_err(|_| bad())?;
    let l: usize = fields[1].parse().map_err(|_| bad())?;
    let scoring = fields[2]
        .parse()
        .ok()
        .and_then(ScoringType::from_code)
        .ok_or_else(bad)?;
    let weighting = fields[3]
        .parse()
        .ok()
        .and_then(WeightingType::from_code)
        .ok_or_else(bad)?;
    let config = VocabularyConfig::new(k, l, weighting, scoring);
    config.validate().map_err(|e| BowErr::Format(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::tests::{orb_corpus, sift_corpus};
    use crate::{DescriptorKind, OrbDesc, SiftDesc};

    #[test]
    fn text_round_trip_orb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orb_vocabulary.txt");
        let config = VocabularyConfig::new(3, 3, WeightingType::TfIdf, ScoringType::L1Norm);
        let voc = Vocabulary::create(&orb_corpus(4, 40, 21), config).unwrap();
        voc.save_txt(&path).unwrap();
        let loaded = Vocabulary::<OrbDesc>::load_txt(&path).unwrap();
        assert!(voc == loaded);
    }

    #[test]
    fn text_round_trip_sift() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift_vocabulary.txt");
        let config = VocabularyConfig::default_for(DescriptorKind::Sift);
        let voc = Vocabulary::create(&sift_corpus(3, 15, 22), config).unwrap();
        voc.save_txt(&path).unwrap();
        assert!(voc == Vocabulary::<SiftDesc>::load_txt(&path).unwrap());
    }

    #[test]
    fn header_and_first_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.txt");
        let corpus: Vec<Vec<OrbDesc>> = vec![vec![[0; 32]], vec![[255; 32]]];
        let config = VocabularyConfig::new(2, 1, WeightingType::Tf, ScoringType::L2Norm);
        Vocabulary::create(&corpus, config)
            .unwrap()
            .save_txt(&path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "2 1 1 1");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0 1 0 0 "));
        assert!(lines[2].starts_with("0 1 255 255 "));
        assert!(lines[2].ends_with(" 1"));
    }

    #[test]
    fn wrong_component_count_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.txt");
        let config = VocabularyConfig::default_for(DescriptorKind::Sift);
        Vocabulary::create(&sift_corpus(2, 5, 23), config)
            .unwrap()
            .save_txt(&path)
            .unwrap();
        assert!(matches!(
            Vocabulary::<OrbDesc>::load_txt(&path),
            Err(BowErr::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn malformed_text_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.txt");
        let zeros = vec!["0"; 32].join(" ");
        for content in [
            String::new(),
            "10 6\n".to_string(),
            "10 6 9 0\n".to_string(),
            "2 1 0 0\n".to_string(),
            format!("2 1 0 0\n5 1 {} 1\n", zeros),
            format!("2 1 0 0\n0 2 {} 1\n", zeros),
            format!("2 1 0 0\n0 1 {} heavy\n", zeros),
            "2 1 0 0\n0 1 5\n".to_string(),
        ] {
            std::fs::write(&path, &content).unwrap();
            assert!(
                matches!(Vocabulary::<OrbDesc>::load_txt(&path), Err(BowErr::Format(_))),
                "accepted {:?}",
                content
            );
        }
    }
}
