// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Keeps every name and symlink target received over the filesystem bridge
//! inside the exported directory. The export never follows `..`, never creates
//! absolute symlinks and never accepts names containing separators.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Confine bridge file operations to the exported tree

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path outside export boundary: {0}")]
    OutsideBoundary(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

/// Validates names and link targets against an export root.
#[derive(Debug, Clone)]
pub struct PathSanitizer {
    /// Maximum length of a single name component (default: 255)
    max_name_len: usize,
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self { max_name_len: 255 }
    }

    pub fn with_max_length(max_name_len: usize) -> Self {
        Self { max_name_len }
    }

    /// Validate one directory entry name as sent by a client.
    ///
    /// # Examples
    /// ```
    /// use sandshell_core::domain::path_sanitizer::PathSanitizer;
    ///
    /// let sanitizer = PathSanitizer::new();
    /// assert_eq!(sanitizer.child_name(b"a.txt").unwrap(), "a.txt");
    /// assert!(sanitizer.child_name(b"..").is_err());
    /// assert!(sanitizer.child_name(b"etc/passwd").is_err());
    /// ```
    pub fn child_name(&self, raw: &[u8]) -> Result<String, PathSanitizerError> {
        let name = std::str::from_utf8(raw)
            .map_err(|_| PathSanitizerError::InvalidPath(String::from_utf8_lossy(raw).into_owned()))?;

        if name.is_empty() || name.contains('\0') {
            return Err(PathSanitizerError::InvalidPath(name.to_string()));
        }
        if name.len() > self.max_name_len {
            return Err(PathSanitizerError::PathTooLong(name.to_string()));
        }
        if name == "." || name == ".." {
            tracing::warn!(name = %name, "Path traversal attempt detected: dot entry as name");
            return Err(PathSanitizerError::PathTraversal(name.to_string()));
        }
        if name.contains('/') {
            tracing::warn!(name = %name, "Path traversal attempt detected: separator in name");
            return Err(PathSanitizerError::PathTraversal(name.to_string()));
        }
        Ok(name.to_string())
    }

    /// Validate a symlink target created in `link_dir` (relative to the export
    /// root). Targets must be relative and must not climb above the root.
    pub fn symlink_target(&self, link_dir: &Path, raw: &[u8]) -> Result<PathBuf, PathSanitizerError> {
        let target = std::str::from_utf8(raw)
            .map_err(|_| PathSanitizerError::InvalidPath(String::from_utf8_lossy(raw).into_owned()))?;
        if target.is_empty() || target.contains('\0') {
            return Err(PathSanitizerError::InvalidPath(target.to_string()));
        }

        let target_path = PathBuf::from(target);
        if target_path.is_absolute() {
            return Err(PathSanitizerError::OutsideBoundary(target.to_string()));
        }

        let mut depth = link_dir
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count();
        for component in target_path.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        tracing::warn!(target = %target, "Symlink target escapes export root");
                        return Err(PathSanitizerError::OutsideBoundary(target.to_string()));
                    }
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathSanitizerError::OutsideBoundary(target.to_string()));
                }
            }
        }
        Ok(target_path)
    }

    /// Strip `root` from an absolute host path, rejecting anything outside it.
    pub fn strip_root(&self, root: &Path, path: &Path) -> Result<PathBuf, PathSanitizerError> {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PathSanitizerError::PathTraversal(path.display().to_string()));
        }
        path.strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| PathSanitizerError::OutsideBoundary(path.display().to_string()))
    }
}
