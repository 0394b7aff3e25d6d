// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path helpers for absolute, slash-separated VFS paths.
//!
//! All paths entering the core are absolute. A trailing slash on a non-root
//! path expresses directory intent: the operation must fail if the target is
//! not a directory.

use crate::error::{FsError, FsResult};

/// Check that a path is usable: absolute and free of relative segments.
pub fn validate(path: &str) -> FsResult<()> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument);
    }
    if segments(path).any(|s| s == "." || s == "..") {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

/// Iterate over the non-empty segments of a path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// True when a non-root path carries a trailing slash, i.e. the caller
/// requires the target to be a directory.
pub fn wants_directory(path: &str) -> bool {
    path.len() > 1 && path.ends_with('/')
}

/// Final segment of a path, if any.
pub fn file_name(path: &str) -> Option<&str> {
    segments(path).last()
}

/// Strip a trailing slash from a non-root path.
pub fn trim_trailing(path: &str) -> &str {
    if wants_directory(path) {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Split a path into the remaining path of its parent directory and the
/// final name. Fails on the root path, which has no parent.
pub fn split_parent(path: &str) -> FsResult<(String, &str)> {
    let trimmed = trim_trailing(path);
    let name = file_name(trimmed).ok_or(FsError::InvalidArgument)?;
    let parent_len = trimmed.len() - name.len();
    let parent = &trimmed[..parent_len];
    let parent = if parent.len() > 1 {
        parent.trim_end_matches('/').to_string()
    } else {
        "/".to_string()
    };
    Ok((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_relative() {
        assert!(validate("/a/b").is_ok());
        assert!(matches!(validate("a/b"), Err(FsError::InvalidArgument)));
        assert!(matches!(validate("/a/../b"), Err(FsError::InvalidName)));
        assert!(matches!(validate("/./a"), Err(FsError::InvalidName)));
    }

    #[test]
    fn test_segments_skip_empties() {
        let segs: Vec<&str> = segments("//a///b/").collect();
        assert_eq!(segs, vec!["a", "b"]);
        assert_eq!(segments("/").count(), 0);
    }

    #[test]
    fn test_wants_directory() {
        assert!(wants_directory("/a/"));
        assert!(!wants_directory("/a"));
        assert!(!wants_directory("/"));
    }

    #[test]
    fn test_split_parent() {
        let (parent, name) = split_parent("/a/b/c").expect("split should succeed");
        assert_eq!(parent, "/a/b");
        assert_eq!(name, "c");

        let (parent, name) = split_parent("/top").expect("split should succeed");
        assert_eq!(parent, "/");
        assert_eq!(name, "top");

        let (parent, name) = split_parent("/a/dir/").expect("split should succeed");
        assert_eq!(parent, "/a");
        assert_eq!(name, "dir");

        assert!(split_parent("/").is_err());
    }
}
