//! Helpers for the `/`-separated paths used by the coordination service.

use crate::CoordError;

pub const ROOT: &str = "/";

/// Normalizes a path so it always begins with `/` and never ends with one.
///
/// Empty segments (`//`) and relative segments (`.` and `..`) are rejected.
pub fn normalize(path: &str) -> Result<String, CoordError> {
    let trimmed = path.trim();
    let stripped = trimmed.trim_matches('/');
    if stripped.is_empty() {
        return Ok(ROOT.to_string());
    }

    let mut normalized = String::with_capacity(stripped.len() + 1);
    for segment in stripped.split('/') {
        validate_segment(segment).map_err(|reason| CoordError::InvalidPath {
            path: path.to_string(),
            reason,
        })?;
        normalized.push('/');
        normalized.push_str(segment);
    }

    Ok(normalized)
}

/// Joins a child name onto a normalized parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Returns the parent of a normalized path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }

    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Returns the last segment of a normalized path.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Iterates the segments of a normalized path, root first.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Returns if `path` is `ancestor` itself or lives somewhere beneath it.
pub fn is_within(ancestor: &str, path: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }

    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Checks a single path segment, for example a cluster name.
pub fn validate_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("empty path segment");
    }
    if segment == "." || segment == ".." {
        return Err("relative path segment");
    }
    if segment.contains('/') {
        return Err("segment contains a separator");
    }
    if segment.chars().any(char::is_control) {
        return Err("segment contains a control character");
    }
    Ok(())
}
