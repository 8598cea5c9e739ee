use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;
use uuid::Uuid;

/// The directory holding the uploaded experiment archives.
#[derive(Clone, Debug)]
pub struct ArchiveWorkspace {
    root: PathBuf,
}

impl ArchiveWorkspace {
    /// Opens the workspace, creating its directory if needed.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh path for an incoming archive.
    pub fn allocate(&self) -> PathBuf {
        self.root.join(format!("{}.zip", Uuid::new_v4()))
    }
}
