use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::artifact::Artifact;
use crate::error::MigrationError;

/// Directory of artifact files, one JSON document per artifact.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every `*.json` artifact. A missing directory is an empty store.
    pub fn load(&self) -> Result<Vec<Artifact>, MigrationError> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "artifact store does not exist yet");
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(&self.dir).map_err(|e| MigrationError::store(&self.dir, e.to_string()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MigrationError::store(&self.dir, e.to_string()))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut artifacts = Vec::with_capacity(paths.len());
        for path in paths {
            let raw =
                fs::read_to_string(&path).map_err(|e| MigrationError::store(&path, e.to_string()))?;
            let artifact: Artifact = serde_json::from_str(&raw)
                .map_err(|e| MigrationError::store(&path, format!("invalid artifact: {e}")))?;
            artifacts.push(artifact);
        }

        debug!(dir = %self.dir.display(), count = artifacts.len(), "artifacts loaded");
        Ok(artifacts)
    }

    /// Persist a new artifact. Existing files are never overwritten, and a
    /// failed write leaves no artifact behind.
    pub fn write(&self, artifact: &Artifact) -> Result<PathBuf, MigrationError> {
        fs::create_dir_all(&self.dir).map_err(|e| MigrationError::store(&self.dir, e.to_string()))?;

        let path = self.dir.join(artifact.file_name());
        if path.exists() {
            return Err(MigrationError::store(&path, "artifact file already exists"));
        }

        let body = serde_json::to_string_pretty(artifact)
            .map_err(|e| MigrationError::store(&path, format!("cannot encode artifact: {e}")))?;

        // Staged under a name `load` ignores, then renamed into place.
        let staging = self.dir.join(format!(".{}.tmp", artifact.revision));
        let staged = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .and_then(|mut file| {
                file.write_all(body.as_bytes())?;
                file.write_all(b"\n")?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&staging, &path));

        if let Err(e) = staged {
            let _ = fs::remove_file(&staging);
            return Err(MigrationError::store(&path, e.to_string()));
        }

        debug!(path = %path.display(), revision = %artifact.revision, "artifact written");
        Ok(path)
    }
}
