use atomic_write_file::AtomicWriteFile;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};
use tracing::debug;

use super::Vocabulary;
use crate::{BowErr, BowResult, Descriptor, DescriptorKind, VocabularyConfig};

const MAGIC: &[u8; 8] = b"ABOWVOC\0";
const FORMAT_VERSION: u32 = 1;
const COMPRESSION_LEVEL: i32 = 3;

/// Everything needed to interpret the tree that follows it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct ArtifactHeader {
    descriptor: DescriptorKind,
    descriptor_len: u32,
    config: VocabularyConfig,
    words: u64,
}

type ArtifactStream = zstd::Decoder<'static, BufReader<File>>;

impl<D: Descriptor> Vocabulary<D> {
    /// Save the vocabulary as a compressed binary artifact.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so an interrupted save never leaves a partial artifact behind.
    pub fn save<P: AsRef<Path>>(&self, file: P) -> BowResult<()> {
        let header = ArtifactHeader {
            descriptor: D::KIND,
            descriptor_len: D::LEN as u32,
            config: self.config,
            words: self.num_leaves as u64,
        };
        let mut file = AtomicWriteFile::open(file.as_ref())?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            writer.write_all(MAGIC)?;
            writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
            let mut encoder = zstd::Encoder::new(&mut writer, COMPRESSION_LEVEL)?;
            bincode::serialize_into(&mut encoder, &header)?;
            bincode::serialize_into(&mut encoder, self)?;
            encoder.finish()?;
            writer.flush()?;
        }
        file.commit()?;
        Ok(())
    }

    /// Load a vocabulary saved with [`Vocabulary::save`].
    pub fn load<P: AsRef<Path>>(file: P) -> BowResult<Self> {
        let (header, mut stream) = open(file.as_ref())?;
        if header.descriptor != D::KIND || header.descriptor_len as usize != D::LEN {
            return Err(BowErr::ConfigMismatch {
                expected: D::KIND.to_string(),
                found: format!(
                    "{} ({} components)",
                    header.descriptor.name(),
                    header.descriptor_len
                ),
            });
        }
        let v: Self = bincode::deserialize_from(&mut stream).map_err(corrupt)?;
        if v.config != header.config || v.num_leaves as u64 != header.words {
            return Err(BowErr::Format(
                "header does not match the stored tree".to_string(),
            ));
        }
        v.validate()?;
        debug!("Loaded {:?}", v);
        Ok(v)
    }

    /// Load a vocabulary that must have been built with `config`.
    pub fn load_expecting<P: AsRef<Path>>(file: P, config: &VocabularyConfig) -> BowResult<Self> {
        let v = Self::load(file)?;
        if v.config != *config {
            return Err(BowErr::Format(format!(
                "vocabulary was built with k = {}, L = {}, {}, {}; expected k = {}, L = {}, {}, {}",
                v.config.k,
                v.config.l,
                v.config.weighting,
                v.config.scoring,
                config.k,
                config.l,
                config.weighting,
                config.scoring
            )));
        }
        Ok(v)
    }
}

/// Descriptor family stored in a binary artifact, reading only its header.
pub fn peek_kind<P: AsRef<Path>>(file: P) -> BowResult<DescriptorKind> {
    open(file.as_ref()).map(|(header, _)| header.descriptor)
}

fn open(path: &Path) -> BowResult<(ArtifactHeader, ArtifactStream)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut preamble = [0u8; 12];
    reader.read_exact(&mut preamble).map_err(|_| {
        BowErr::Format(format!("{} is too short to be a vocabulary", path.display()))
    })?;
    if &preamble[..8] != MAGIC {
        return Err(BowErr::Format(format!(
            "{} is not a binary vocabulary",
            path.display()
        )));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&preamble[8..]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(BowErr::Format(format!(
            "unsupported vocabulary format version {}",
            version
        )));
    }
    let mut stream = zstd::Decoder::with_buffer(reader)?;
    let header: ArtifactHeader = bincode::deserialize_from(&mut stream).map_err(corrupt)?;
    Ok((header, stream))
}

fn corrupt(e: bincode::Error) -> BowErr {
    BowErr::Format(format!("corrupt vocabulary stream: {}", e))
}
