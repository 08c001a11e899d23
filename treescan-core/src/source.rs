//! Source-tree acquisition: a local directory, or a throwaway git clone.

use crate::error::ScanError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::info;

/// A materialized source tree. Clones are deleted when this value drops,
/// whichever way the scan ends.
#[derive(Debug)]
pub enum SourceTree {
    Local(PathBuf),
    Cloned { url: String, dir: TempDir },
}

impl SourceTree {
    pub fn local(path: &Path) -> Self {
        Self::Local(path.to_path_buf())
    }

    /// Shallow, blob-filtered clone into a fresh temporary directory
    pub fn clone_repo(url: &str) -> crate::Result<Self> {
        let dir = tempfile::Builder::new().prefix("treescan-").tempdir()?;
        info!(url, path = %dir.path().display(), "cloning");

        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--filter=blob:none", "--quiet"])
            .arg(url)
            .arg(dir.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| ScanError::Clone {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            // `dir` drops here and removes the partial clone
            return Err(ScanError::Clone {
                url: url.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Self::Cloned {
            url: url.to_string(),
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Local(path) => path,
            Self::Cloned { dir, .. } => dir.path(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Cloned { .. })
    }
}

/// Get the HEAD commit SHA for a tree, or None if not a git repo / git unavailable.
pub fn head_commit_sha(root: &Path) -> Option<String> {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(root)
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                Some(String::from_utf8_lossy(&o.stdout).trim().to_string())
            } else {
                None
            }
        })
}
