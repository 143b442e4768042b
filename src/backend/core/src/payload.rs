//! Payload sources: resolve a job's `source_ref` to bytes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Where batch payloads come from.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Whether `source_ref` currently resolves to a payload.
    async fn exists(&self, source_ref: &str) -> Result<bool>;

    /// Read the full payload. Missing payloads yield `SourceNotFound`.
    async fn load(&self, source_ref: &str) -> Result<Vec<u8>>;
}

/// Reads payloads from the local filesystem.
///
/// Relative references are resolved against `root` when one is set.
/// Files are never removed after upload.
#[derive(Debug, Clone, Default)]
pub struct FsPayloadSource {
    root: Option<PathBuf>,
}

impl FsPayloadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn resolve(&self, source_ref: &str) -> PathBuf {
        let path = Path::new(source_ref);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl PayloadSource for FsPayloadSource {
    async fn exists(&self, source_ref: &str) -> Result<bool> {
        match tokio::fs::metadata(self.resolve(source_ref)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, source_ref: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.resolve(source_ref))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::source_not_found(source_ref).with_source(e),
                _ => PipelineError::from(e),
            })
    }
}
