//! Filesystem tools confined to one directory.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Refuse to return more than this from `read_file`.
const MAX_READ_BYTES: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Path escapes the sandbox: {0}")]
    OutsideSandbox(String),
    #[error("File too large ({0} bytes)")]
    TooLarge(u64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create the directory if needed and pin its canonical path.
    pub fn open(dir: &Path) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(dir)?;
        let root = dir.canonicalize()?;
        tracing::info!("[sandbox] filesystem tools rooted at {}", root.display());
        Ok(Self { root })
    }

    /// Lexically resolve a relative path. Absolute paths and `..` are refused.
    fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let path = Path::new(relative);
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::OutsideSandbox(relative.to_string()));
                }
            }
        }
        if resolved == self.root {
            return Err(SandboxError::OutsideSandbox(relative.to_string()));
        }
        Ok(resolved)
    }

    /// Symlinks inside the sandbox may still point elsewhere.
    fn ensure_inside(&self, path: &Path, requested: &str) -> Result<(), SandboxError> {
        let real = path.canonicalize()?;
        if real.starts_with(&self.root) {
            Ok(())
        } else {
            Err(SandboxError::OutsideSandbox(requested.to_string()))
        }
    }

    pub async fn read_file(&self, relative: &str) -> Result<String, SandboxError> {
        let path = self.resolve(relative)?;
        self.ensure_inside(&path, relative)?;
        let len = tokio::fs::metadata(&path).await?.len();
        if len > MAX_READ_BYTES {
            return Err(SandboxError::TooLarge(len));
        }
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    /// Check the deepest part of `path` that already exists. Nothing below
    /// it exists yet, so it cannot hide a link.
    async fn ensure_existing_ancestor_inside(&self, path: &Path, requested: &str) -> Result<(), SandboxError> {
        let mut current = path;
        loop {
            match tokio::fs::symlink_metadata(current).await {
                Ok(_) => return self.ensure_inside(current, requested),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    current = current
                        .parent()
                        .ok_or_else(|| SandboxError::OutsideSandbox(requested.to_string()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the number of bytes written. Never writes through a symlink
    /// and never creates directories before the path is checked.
    pub async fn write_file(&self, relative: &str, content: &str) -> Result<usize, SandboxError> {
        let path = self.resolve(relative)?;
        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await {
            if meta.file_type().is_symlink() {
                return Err(SandboxError::OutsideSandbox(relative.to_string()));
            }
        }
        self.ensure_existing_ancestor_inside(&path, relative).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            self.ensure_inside(parent, relative)?;
        }
        tokio::fs::write(&path, content).await?;
        tracing::info!("[sandbox] wrote {} bytes to {}", content.len(), relative);
        Ok(content.len())
    }
}
