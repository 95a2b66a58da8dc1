use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::{config::ScanConfig, BowErr, BowResult};

/// Ordered list of the training images found under a root directory.
///
/// Paths are sorted, so an unchanged directory tree always yields the same
/// corpus regardless of the order the filesystem lists entries in.
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    root: PathBuf,
    images: Vec<PathBuf>,
}

impl Corpus {
    /// Recursively collect every file under `root` whose extension is in the allow-list.
    pub fn scan<P: AsRef<Path>>(root: P, cfg: &ScanConfig) -> BowResult<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = fs::metadata(&root).map_err(|e| BowErr::Path {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(BowErr::Path {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        let entries = fs::read_dir(&root).map_err(|e| BowErr::Path {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        let allowed: Vec<String> = cfg
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let mut images = Vec::new();
        let mut pending = vec![entries];
        while let Some(entries) = pending.pop() {
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable directory entry: {}", e);
                        continue;
                    }
                };
                let path = entry.path();
                // follows symlinks
                let meta = match fs::metadata(&path) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("Skipping {:?}: {}", path, e);
                        continue;
                    }
                };
                if meta.is_dir() {
                    // symlinked directories are not descended into, which rules out cycles
                    let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(true);
                    if is_link {
                        debug!("Not following directory link {:?}", path);
                        continue;
                    }
                    match fs::read_dir(&path) {
                        Ok(sub) => pending.push(sub),
                        Err(e) => warn!("Skipping unreadable directory {:?}: {}", path, e),
                    }
                } else if has_extension(&path, &allowed) {
                    images.push(path);
                }
            }
        }

        images.sort();
        debug!("Found {} images under {:?}", images.len(), root);
        Ok(Self { root, images })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.images.iter()
    }
}

fn has_extension(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            allowed.iter().any(|a| *a == e)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("b/nested")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("dir.png")).unwrap();
        touch(&root.join("z.png"));
        touch(&root.join("b/nested/x.PNG"));
        touch(&root.join("a/y.png"));
        touch(&root.join("a/notes.txt"));
        touch(&root.join("a/noext"));

        let corpus = Corpus::scan(root, &ScanConfig::default()).unwrap();
        let rel: Vec<_> = corpus
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rel,
            vec![
                PathBuf::from("a/y.png"),
                PathBuf::from("b/nested/x.PNG"),
                PathBuf::from("z.png"),
            ]
        );
    }

    #[test]
    fn scan_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for i in (0..20).rev() {
            let sub = dir.path().join(format!("d{}", i % 3));
            fs::create_dir_all(&sub).unwrap();
            touch(&sub.join(format!("img_{:02}.png", i)));
        }
        let first = Corpus::scan(dir.path(), &ScanConfig::default()).unwrap();
        let second = Corpus::scan(dir.path(), &ScanConfig::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn custom_extensions() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.jpg"));
        touch(&dir.path().join("b.JPEG"));
        touch(&dir.path().join("c.png"));
        let cfg = ScanConfig {
            extensions: vec![".jpg".into(), "jpeg".into()],
        };
        let corpus = Corpus::scan(dir.path(), &cfg).unwrap();
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn missing_root_is_path_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Corpus::scan(dir.path().join("nope"), &ScanConfig::default()).unwrap_err();
        assert!(matches!(err, BowErr::Path { .. }));

        let file = dir.path().join("file.png");
        touch(&file);
        let err = Corpus::scan(&file, &ScanConfig::default()).unwrap_err();
        assert!(matches!(err, BowErr::Path { .. }));
    }
}
