//! Source file discovery under a scan root.

use crate::config::DiscoveryConfig;
use crate::error::ScanError;
use crate::grammar::GrammarRegistry;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Build a matcher for user ignore patterns. Bare names ("vendor") match
/// that component anywhere, including everything below it.
fn build_ignore_set(patterns: &[String]) -> crate::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob_pattern = if pattern.contains('*') || pattern.contains('?') || pattern.contains('/') {
            pattern.clone()
        } else {
            format!("**/{}", pattern)
        };
        builder.add(Glob::new(&glob_pattern).map_err(|e| ScanError::GlobPattern(e.to_string()))?);
        builder.add(
            Glob::new(&format!("{}/**", glob_pattern))
                .map_err(|e| ScanError::GlobPattern(e.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|e| ScanError::GlobPattern(e.to_string()))
}

/// All regular files under `root` whose extension has a registered grammar,
/// sorted by path. A missing root yields an empty list.
pub fn discover(
    root: &Path,
    registry: &GrammarRegistry,
    config: &DiscoveryConfig,
) -> crate::Result<Vec<PathBuf>> {
    let ignore_set = build_ignore_set(&config.ignore)?;

    if !root.is_dir() {
        debug!(root = %root.display(), "scan root is not a directory");
        return Ok(Vec::new());
    }

    let mut builder = WalkBuilder::new(root);
    builder.standard_filters(false);
    builder.follow_links(false);
    builder.filter_entry(|entry| entry.file_name() != ".git");
    if config.respect_gitignore {
        builder.git_ignore(true);
        builder.git_exclude(true);
        builder.ignore(true);
        builder.require_git(false);
    }

    let mut files = Vec::new();

    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);

        if ignore_set.is_match(relative) {
            continue;
        }

        if registry.is_supported(path) {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}
