//! Small sidecar manifest persisting the one fact a component's own
//! [`crate::LogBackend`] cannot answer on its own: where `trim_pos` was
//! left at last shutdown. Grounded on the teacher's
//! `wal::segment::Manifest`, which persists segment/rotation bookkeeping
//! to a JSON file next to the WAL directory; generalized here to the one
//! `u64` every LLFS log-backed component (allocator, recycler, volume)
//! needs in order to pass a `trim_hint` into its `LogDevice::recover`.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrimManifest {
    pub trim_pos: u64,
}

impl TrimManifest {
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn store(path: &Path, trim_pos: u64) -> io::Result<()> {
        let content = serde_json::to_string(&Self { trim_pos })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Where a component should persist its `TrimManifest`, if anywhere.
/// `None` means "no sidecar" (typical for in-memory/test backends, where
/// nothing survives a restart anyway and recovery always starts from
/// `trim_pos = 0`).
#[derive(Debug, Clone, Default)]
pub struct ManifestPath(pub Option<PathBuf>);

impl ManifestPath {
    pub fn none() -> Self {
        ManifestPath(None)
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        ManifestPath(Some(path.into()))
    }

    pub fn load_trim_pos(&self) -> io::Result<u64> {
        match &self.0 {
            Some(path) => Ok(TrimManifest::load(path)?.trim_pos),
            None => Ok(0),
        }
    }

    pub fn store_trim_pos(&self, trim_pos: u64) -> io::Result<()> {
        match &self.0 {
            Some(path) => TrimManifest::store(path, trim_pos),
            None => Ok(()),
        }
    }
}
