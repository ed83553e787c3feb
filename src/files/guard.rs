//! Path containment for every file served from the storage root.

use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::error::FileError;

/// Drops the public prefix (`/gh/` or `gh/`) some stored paths carry.
pub fn strip_base_url<'a>(path: &'a str, base_url: &str) -> &'a str {
    let base = base_url.trim_matches('/');
    if base.is_empty() {
        return path.trim_start_matches('/');
    }
    let trimmed = path.trim_start_matches('/');
    match trimmed.strip_prefix(base) {
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => path,
    }
}

/// Rejects names that try to leave the storage root before touching the
/// filesystem.
fn check_relative(relative: &str) -> Result<&Path, FileError> {
    if relative.trim().is_empty() {
        return Err(FileError::MissingName);
    }
    if relative.contains('\0')
        || relative.contains("..")
        || relative.starts_with("./")
        || relative.contains('~')
        || relative.starts_with('/')
        || relative.starts_with('\\')
    {
        return Err(FileError::Traversal);
    }

    let path = Path::new(relative);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(FileError::Traversal);
    }
    Ok(path)
}

/// Canonical path of `relative` inside `root`. Missing files are
/// `NotFound`; symlinks or anything else resolving outside the root are
/// `OutsideRoot`.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, FileError> {
    let relative = check_relative(relative)?;

    let root = root.canonicalize().map_err(|e| {
        warn!("Storage root unavailable: {}", e);
        FileError::NotFound
    })?;
    let candidate = root
        .join(relative)
        .canonicalize()
        .map_err(|_| FileError::NotFound)?;

    if !candidate.starts_with(&root) {
        warn!("Blocked access outside storage root: {}", relative.display());
        return Err(FileError::OutsideRoot);
    }
    if !candidate.is_file() {
        return Err(FileError::NotFound);
    }
    Ok(candidate)
}

/// Notification attachments were historically stored with a `../` prefix
/// relative to the admin pages. The prefix is dropped and, when the stored
/// location is gone, `fallback_dir/file_name` is tried.
pub fn resolve_legacy(
    root: &Path,
    stored: &str,
    fallback_dir: &str,
    file_name: &str,
) -> Result<PathBuf, FileError> {
    let mut relative = stored.trim();
    while let Some(rest) = relative.strip_prefix("../") {
        relative = rest;
    }

    match resolve_within(root, relative) {
        Err(FileError::NotFound) | Err(FileError::MissingName) if !file_name.is_empty() => {
            let fallback = format!("{}/{}", fallback_dir.trim_end_matches('/'), file_name);
            resolve_within(root, &fallback)
        }
        other => other,
    }
}
