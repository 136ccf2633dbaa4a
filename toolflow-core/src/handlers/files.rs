use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use toolflow_commons::ErrorCategory;

use super::ToolHandler;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("path {path} escapes the workspace root")]
    OutsideWorkspace { path: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReadError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::InvalidRequest,
            Self::OutsideWorkspace { .. } => ErrorCategory::PolicyDenied,
            Self::Io { source, .. } if source.kind() == ErrorKind::PermissionDenied => {
                ErrorCategory::Authentication
            }
            Self::Io { .. } => ErrorCategory::Unknown,
        }
    }
}

/// Result of a bounded read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub bytes_read: usize,
    /// The file holds more than `bytes_read` bytes.
    pub truncated: bool,
}

/// Bounded file access used by `read_file` steps.
#[async_trait]
pub trait FileReader: Send + Sync {
    async fn read(&self, path: &str, max_bytes: usize) -> Result<FileContent, ReadError>;
}

/// Reads files under a workspace root; paths resolving outside it are
/// rejected, symlinks included.
#[derive(Debug, Clone)]
pub struct WorkspaceFileReader {
    root: PathBuf,
}

impl WorkspaceFileReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, path: &str) -> Result<PathBuf, ReadError> {
        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        if !normalize(&joined).starts_with(normalize(&self.root)) {
            return Err(ReadError::OutsideWorkspace { path: path.into() });
        }

        let canonical = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|source| io_error(path, source))?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|source| io_error(path, source))?;
        if !canonical.starts_with(&root) {
            return Err(ReadError::OutsideWorkspace { path: path.into() });
        }
        Ok(canonical)
    }
}

#[async_trait]
impl FileReader for WorkspaceFileReader {
    async fn read(&self, path: &str, max_bytes: usize) -> Result<FileContent, ReadError> {
        let resolved = self.resolve(path).await?;
        let file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|source| io_error(path, source))?;

        // One extra byte tells a file of exactly `max_bytes` from a longer one.
        let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
        let mut buffer = Vec::new();
        file.take(limit)
            .read_to_end(&mut buffer)
            .await
            .map_err(|source| io_error(path, source))?;

        let truncated = buffer.len() > max_bytes;
        buffer.truncate(max_bytes);
        if truncated {
            // Drop a multi-byte character cut by the limit.
            if let Err(err) = std::str::from_utf8(&buffer)
                && err.error_len().is_none()
            {
                buffer.truncate(err.valid_up_to());
            }
        }
        let bytes_read = buffer.len();
        tracing::debug!(path, bytes_read, truncated, "read file");
        Ok(FileContent {
            path: path.to_string(),
            content: String::from_utf8_lossy(&buffer).into_owned(),
            bytes_read,
            truncated,
        })
    }
}

fn io_error(path: &str, source: std::io::Error) -> ReadError {
    if source.kind() == ErrorKind::NotFound {
        ReadError::NotFound { path: path.into() }
    } else {
        ReadError::Io {
            path: path.into(),
            source,
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileArgs {
    path: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

/// `read_file` exposed as a named tool for `tool_call` steps.
pub struct ReadFileTool {
    reader: Arc<dyn FileReader>,
    default_max_bytes: usize,
}

impl ReadFileTool {
    pub fn new(reader: Arc<dyn FileReader>, default_max_bytes: usize) -> Self {
        Self {
            reader,
            default_max_bytes,
        }
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn describe(&self, args: &Value) -> String {
        match ReadFileArgs::deserialize(args) {
            Ok(args) => format!(
                "read up to {} bytes from {}",
                args.max_bytes.unwrap_or(self.default_max_bytes),
                args.path
            ),
            Err(err) => format!("read_file with invalid arguments: {err}"),
        }
    }

    async fn call(&self, args: &Value) -> Result<Value> {
        let args = ReadFileArgs::deserialize(args)?;
        let content = self
            .reader
            .read(&args.path, args.max_bytes.unwrap_or(self.default_max_bytes))
            .await?;
        Ok(serde_json::to_value(content)?)
    }
}
