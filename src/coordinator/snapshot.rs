//! Content-hash baseline of the worker output root.
//!
//! A claimed file counts as produced by a task only when it exists under the
//! root and its SHA-256 differs from the baseline. The baseline is updated only
//! for files a completion actually handled, so files another worker has
//! written but not yet reported stay detectable.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Snapshot of `relative path -> sha256 hex` under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    root: PathBuf,
    digests: BTreeMap<String, String>,
}

impl Baseline {
    /// Hashes every regular file under `root`, skipping `.git`.
    pub fn capture(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let mut digests = BTreeMap::new();

        if root.exists() {
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git");
            for entry in walker {
                let entry = entry.map_err(io::Error::other)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                digests.insert(normalize(relative), digest_file(entry.path())?);
            }
        }

        Ok(Self { root, digests })
    }

    /// Rebuilds a baseline from persisted digests.
    pub fn from_digests(root: impl Into<PathBuf>, digests: BTreeMap<String, String>) -> Self {
        Self {
            root: root.into(),
            digests,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digests(&self) -> &BTreeMap<String, String> {
        &self.digests
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Returns the claimed files that are new or changed, in claim order.
    ///
    /// Claims outside the root, missing files and duplicates are ignored.
    pub fn detect(&self, claimed: &[String]) -> Vec<String> {
        let mut detected: Vec<String> = Vec::new();
        for claim in claimed {
            let Some(relative) = self.relative(claim) else {
                tracing::debug!(path = %claim, "Ignoring claim outside output root");
                continue;
            };
            if detected.contains(&relative) {
                continue;
            }
            let path = self.root.join(&relative);
            if !path.is_file() {
                continue;
            }
            let Ok(digest) = digest_file(&path) else {
                continue;
            };
            if self.digests.get(&relative) != Some(&digest) {
                detected.push(relative);
            }
        }
        detected
    }

    /// Hashes handled files as they are now; `None` marks a file that is gone.
    pub fn current(&self, files: &[String]) -> Vec<(String, Option<String>)> {
        files
            .iter()
            .map(|file| (file.clone(), digest_file(&self.root.join(file)).ok()))
            .collect()
    }

    /// Records digests taken by `current`; missing files are forgotten.
    pub fn absorb(&mut self, current: Vec<(String, Option<String>)>) {
        for (file, digest) in current {
            match digest {
                Some(digest) => {
                    self.digests.insert(file, digest);
                }
                None => {
                    self.digests.remove(&file);
                }
            }
        }
    }

    fn relative(&self, claim: &str) -> Option<String> {
        let path = Path::new(claim);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        let normalized = normalize(relative);
        (!normalized.is_empty()).then_some(normalized)
    }
}

/// SHA-256 of a file's contents, hex encoded.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn normalize(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_capture_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.py", "x = 1\n");
        write(dir.path(), ".git/HEAD", "ref: refs/heads/main\n");

        let baseline = Baseline::capture(dir.path()).unwrap();

        assert_eq!(baseline.len(), 1);
        assert!(baseline.digests().contains_key("src/lib.py"));
    }

    #[test]
    fn test_detect_new_and_changed_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "old.py", "unchanged\n");
        write(dir.path(), "edit.py", "before\n");
        let baseline = Baseline::capture(dir.path()).unwrap();

        write(dir.path(), "edit.py", "after\n");
        write(dir.path(), "new.py", "fresh\n");

        let claimed = vec![
            "old.py".to_string(),
            "edit.py".to_string(),
            "new.py".to_string(),
            "missing.py".to_string(),
            "./new.py".to_string(),
        ];
        assert_eq!(baseline.detect(&claimed), vec!["edit.py", "new.py"]);
    }

    #[test]
    fn test_detect_rejects_escaping_claims() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = Baseline::capture(dir.path().join("out")).unwrap();
        write(dir.path(), "secret.txt", "nope\n");

        assert!(baseline.detect(&["../secret.txt".to_string()]).is_empty());
    }

    #[test]
    fn test_detect_accepts_absolute_paths_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = Baseline::capture(dir.path()).unwrap();
        write(dir.path(), "a.py", "print('hi')\n");

        let absolute = dir.path().join("a.py").to_string_lossy().into_owned();
        assert_eq!(baseline.detect(&[absolute]), vec!["a.py"]);
    }

    #[test]
    fn test_absorb_keeps_unreported_files_detectable() {
        let dir = tempfile::tempdir().unwrap();
        let mut baseline = Baseline::capture(dir.path()).unwrap();
        write(dir.path(), "mine.py", "a\n");
        write(dir.path(), "theirs.py", "b\n");

        let current = baseline.current(&["mine.py".to_string()]);
        baseline.absorb(current);

        assert!(baseline.detect(&["mine.py".to_string()]).is_empty());
        assert_eq!(baseline.detect(&["theirs.py".to_string()]), vec!["theirs.py"]);
    }

    #[test]
    fn test_absorb_forgets_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "gone.py", "a\n");
        let mut baseline = Baseline::capture(dir.path()).unwrap();

        fs::remove_file(dir.path().join("gone.py")).unwrap();
        let current = baseline.current(&["gone.py".to_string()]);
        assert_eq!(current, vec![("gone.py".to_string(), None)]);
        baseline.absorb(current);

        assert!(baseline.is_empty());
    }
}
