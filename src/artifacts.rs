// Artifact storage
// Byte-blob storage for original uploads and rendered overlays / tokens

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Image as submitted by the operator
    Upload,
    /// Keypoint overlays and QR tokens
    Processed,
}

/// Reference to a stored artifact, handed back to callers for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub kind: ArtifactKind,
    pub name: String,
}

pub trait ArtifactStore: Send + Sync {
    fn put(&self, kind: ArtifactKind, name: &str, bytes: &[u8]) -> Result<ArtifactHandle>;
    fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>>;
}

/// Stores artifacts as files in an uploads and a processed directory
pub struct FsArtifactStore {
    upload_dir: PathBuf,
    processed_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(upload_dir: PathBuf, processed_dir: PathBuf) -> Result<Self> {
        for dir in [&upload_dir, &processed_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create artifact directory {:?}", dir))?;
        }

        Ok(Self {
            upload_dir,
            processed_dir,
        })
    }

    fn dir(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Upload => &self.upload_dir,
            ArtifactKind::Processed => &self.processed_dir,
        }
    }

    /// Resolve a handle to its file, refusing names that would leave the directory
    pub fn path_for(&self, handle: &ArtifactHandle) -> Result<PathBuf> {
        let name = safe_file_name(&handle.name)
            .ok_or_else(|| anyhow!("Invalid artifact name: {}", handle.name))?;
        if name != handle.name {
            return Err(anyhow!("Invalid artifact name: {}", handle.name));
        }
        Ok(self.dir(handle.kind).join(name))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, kind: ArtifactKind, name: &str, bytes: &[u8]) -> Result<ArtifactHandle> {
        let handle = ArtifactHandle {
            kind,
            name: name.to_string(),
        };
        let path = self.path_for(&handle)?;

        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write artifact {:?}", path))?;
        log::debug!("Stored {:?} artifact {:?} ({} bytes)", kind, path, bytes.len());

        Ok(handle)
    }

    fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>> {
        let path = self.path_for(handle)?;
        std::fs::read(&path).with_context(|| format!("Failed to read artifact {:?}", path))
    }
}

/// Final path component of a client-supplied name, if it has a usable one
pub fn safe_file_name(name: &str) -> Option<String> {
    // Client names may use either separator regardless of the host platform
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}
