//! Canonicalized storage paths.

use std::fmt;

/// A client-supplied storage path in canonical form.
///
/// Canonical form is a leading `/` followed by `/`-joined segments. Paths
/// compare byte-for-byte after canonicalization, so `a/b`, `/a/b` and
/// `a//b/` all name the same link.
///
/// Validation happens at construction and nowhere else:
///
/// - at least one segment,
/// - no `.` or `..` segments,
/// - no whitespace or control characters inside segments.
///
/// Paths never touch the filesystem directly (blobs are named by digest),
/// so the rules exist to keep the key space printable and unambiguous, not
/// to guard directory traversal.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilePath(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path has no segments")]
    Empty,
    #[error("path segment {0:?} is not allowed")]
    BadSegment(String),
}

impl FilePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut canonical = String::with_capacity(raw.len() + 1);
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(PathError::BadSegment(segment.to_owned()));
            }
            if segment.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(PathError::BadSegment(segment.to_owned()));
            }
            canonical.push('/');
            canonical.push_str(segment);
        }
        if canonical.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(FilePath(canonical))
    }

    /// Canonical form, with leading slash. This is the link database key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key prefix selecting this path's strict descendants.
    pub fn dir_prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilePath({})", self.0)
    }
}
