/// Filesystem artifacts owned by a stressor
///
/// Removal is idempotent: a file that is already gone counts as cleaned, so
/// the client and the server of one instance can both remove the same socket
/// file on their way out.
use crate::config::types::Result;
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SocketArtifact {
    path: PathBuf,
    removed: bool,
}

impl SocketArtifact {
    /// Track `path` for removal. Nothing is created here.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: false,
        }
    }

    /// Track `path` and clear a stale file left by an earlier crashed run
    pub fn claim(path: impl Into<PathBuf>) -> Result<Self> {
        let artifact = Self::new(path);
        remove_if_present(&artifact.path)?;
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file. Returns true if this call deleted it.
    pub fn remove(&mut self) -> Result<bool> {
        if self.removed {
            return Ok(false);
        }
        let deleted = remove_if_present(&self.path)?;
        self.removed = true;
        Ok(deleted)
    }
}

impl Drop for SocketArtifact {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
