//! Initialization artifacts.
//!
//! An [`InitArtifact`] is a file applied to a backing instance exactly once,
//! right after it is first provisioned: SQL scripts for the relational store,
//! JSON index bodies for the search engine, JSON document arrays for the
//! document store.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::expand_path;

/// A file applied to a freshly provisioned instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitArtifact {
    path: PathBuf,
}

impl InitArtifact {
    /// Creates an artifact from a path. `~` and environment variables are
    /// expanded.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: expand_path(path.as_ref()),
        }
    }

    /// Creates an artifact from an already resolved path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem, used to name the index or collection the artifact creates.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Reads the artifact contents.
    pub async fn read(&self) -> std::io::Result<String> {
        tokio::fs::read_to_string(&self.path).await
    }
}

impl From<&str> for InitArtifact {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for InitArtifact {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for InitArtifact {
    fn from(path: PathBuf) -> Self {
        Self::from_path(path)
    }
}

impl From<&Path> for InitArtifact {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}

impl fmt::Display for InitArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Stable digest of an artifact list, stored as a container label so a
/// reattaching process can tell whether the instance was initialized with
/// the same files.
///
/// Order matters. Unreadable files contribute their path only.
pub fn fingerprint(artifacts: &[InitArtifact]) -> String {
    let mut hasher = Sha256::new();
    for artifact in artifacts {
        hasher.update(artifact.path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if let Ok(contents) = std::fs::read(&artifact.path) {
            hasher.update(&contents);
        }
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_stem() {
        let artifact = InitArtifact::from_path("/schemas/products.json");
        assert_eq!(artifact.stem(), "products");
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "CREATE TABLE a (id TEXT);").unwrap();
        let artifacts = vec![InitArtifact::from_path(file.path())];
        let before = fingerprint(&artifacts);

        writeln!(file, "CREATE TABLE b (id TEXT);").unwrap();
        let after = fingerprint(&artifacts);

        assert_eq!(before.len(), 16);
        assert_ne!(before, after);
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let a = InitArtifact::from_path("/a.sql");
        let b = InitArtifact::from_path("/b.sql");
        assert_ne!(
            fingerprint(&[a.clone(), b.clone()]),
            fingerprint(&[b, a])
        );
        assert_eq!(fingerprint(&[]), fingerprint(&[]));
    }
}
