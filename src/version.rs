//! Freshness versions: one totally ordered stamp covering both filesystem
//! mtimes and persisted configuration entries, so "newer predecessor means
//! rebuild" works uniformly across the two.

use crate::envstore::EnvStore;
use crate::graph::{Graph, VertexId, VertexKind};
use anyhow::{anyhow, bail};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    /// The vertex does not exist yet; orders below every stamp.
    Missing,
    /// Milliseconds since the epoch for filesystem entities; a logical
    /// counter for environment entries.
    Stamp(u64),
}

pub fn mtime_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Answers "how fresh is this vertex?" for every vertex kind.
/// Stats ground truth on every call; nothing is cached across calls.
pub struct Oracle<'a> {
    env: &'a EnvStore,
}

impl<'a> Oracle<'a> {
    pub fn new(env: &'a EnvStore) -> Self {
        Oracle { env }
    }

    pub fn version(&self, graph: &Graph, id: VertexId) -> anyhow::Result<Version> {
        let vertex = graph.vertex(id);
        match vertex.kind {
            VertexKind::File | VertexKind::Artifact | VertexKind::FinalOutput => {
                file_version(&vertex.name)
            }
            VertexKind::Directory => dir_version(&vertex.name),
            VertexKind::EnvEntry => Ok(self.env.version(EnvStore::entry_key(&vertex.name))),
        }
    }
}

fn file_version(path: &str) -> anyhow::Result<Version> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_file() {
                bail!("{}: exists but is not a regular file", path);
            }
            Ok(Version::Stamp(mtime_ms(&meta)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Version::Missing),
        Err(err) => Err(anyhow!("stat {}: {}", path, err)),
    }
}

/// A present directory stamps 0: it exists, but never invalidates dependents.
fn dir_version(path: &str) -> anyhow::Result<Version> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_dir() {
                bail!("{}: exists but is not a directory", path);
            }
            Ok(Version::Stamp(0))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Version::Missing),
        Err(err) => Err(anyhow!("stat {}: {}", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_orders_below_every_stamp() {
        assert!(Version::Missing < Version::Stamp(0));
        assert!(Version::Stamp(0) < Version::Stamp(1));
    }

    #[test]
    fn file_version_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.c");
        let name = path.to_str().unwrap();

        assert_eq!(file_version(name).unwrap(), Version::Missing);

        std::fs::write(&path, "int x;").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(7, 0)).unwrap();
        assert_eq!(file_version(name).unwrap(), Version::Stamp(7000));
    }

    #[test]
    fn file_version_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_version(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn dir_version_present_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().to_str().unwrap();
        assert_eq!(dir_version(name).unwrap(), Version::Stamp(0));
        assert_eq!(
            dir_version(dir.path().join("sub").to_str().unwrap()).unwrap(),
            Version::Missing
        );
    }
}
