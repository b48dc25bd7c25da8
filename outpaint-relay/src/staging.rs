//! Per-request staging directories.
//!
//! Each request owns exactly one [`StagingDir`]. It holds the uploaded input, every file fetched
//! from the remote endpoint for that request, and the copied output. The directory is removed
//! when the value is dropped, which covers every exit path: early error returns, panics unwinding
//! through the pipeline, and the end (or abandonment) of a streamed response body.

use crate::errors::{Error, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

const INPUT_FILE: &str = "input.png";
const OUTPUT_FILE: &str = "output.webp";
const DOWNLOADS_DIR: &str = "remote";

#[derive(Debug)]
pub struct StagingDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagingDir {
    /// Create a fresh, uniquely named directory under `root`.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(Error::io("create staging root"))?;
        let dir = tempfile::Builder::new()
            .prefix("outpaint-")
            .tempdir_in(root)
            .map_err(Error::io("create staging directory"))?;
        let path = dir.path().to_path_buf();
        debug!(staging_dir = %path.display(), "Created staging directory");

        Ok(Self { dir: Some(dir), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_path(&self) -> PathBuf {
        self.path.join(INPUT_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join(OUTPUT_FILE)
    }

    /// Where files fetched from the remote endpoint are written.
    pub fn downloads_path(&self) -> PathBuf {
        self.path.join(DOWNLOADS_DIR)
    }

    /// Write the uploaded bytes as the staged input.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<PathBuf> {
        let input = self.input_path();
        tokio::fs::write(&input, bytes)
            .await
            .map_err(Error::io("save uploaded image"))?;
        debug!(input = %input.display(), size = bytes.len(), "Saved input image");
        Ok(input)
    }

    /// Copy the produced artifact into the staging directory and confirm the copy landed.
    pub async fn copy_output_from(&self, artifact: &Path) -> Result<PathBuf> {
        let output = self.output_path();
        tokio::fs::copy(artifact, &output)
            .await
            .map_err(Error::io(format!("copy result from {}", artifact.display())))?;

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(Error::CopiedArtifactMissing { path: output });
        }
        debug!(output = %output.display(), "Copied result into staging directory");
        Ok(output)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => debug!(staging_dir = %self.path.display(), "Cleaned up staging directory"),
            Err(e) => warn!(staging_dir = %self.path.display(), error = %e, "Failed to delete staging directory"),
        }
    }
}
