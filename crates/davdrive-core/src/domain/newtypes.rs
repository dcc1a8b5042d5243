//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers the engine passes around.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// SyncPath
// ============================================================================

/// A slash-separated path relative to the synchronized folder root.
///
/// `SyncPath` is the key used throughout the engine: journal rows, sync
/// items and remote requests all address files by their relative path.
/// The empty path denotes the folder root itself.
///
/// Invariants enforced at construction:
/// - no leading or trailing `/`
/// - no empty components (`a//b`)
/// - no `.` or `..` components
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPath(String);

impl SyncPath {
    /// Creates a validated `SyncPath` from a relative slash path.
    pub fn new(path: impl Into<String>) -> Result<Self, DomainError> {
        let path = path.into();
        if path.is_empty() {
            return Ok(Self(path));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "path must be relative without trailing slash: {path:?}"
            )));
        }
        for component in path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(DomainError::InvalidPath(format!(
                    "path contains invalid component: {path:?}"
                )));
            }
        }
        Ok(Self(path))
    }

    /// The folder root (empty path).
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last path component, or `""` for the root.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// The parent path; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Appends a single component. The component must not contain `/`.
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name.contains('/') {
            return Err(DomainError::InvalidPath(format!(
                "invalid path component: {name:?}"
            )));
        }
        if self.is_root() {
            Self::new(name)
        } else {
            Self::new(format!("{}/{}", self.0, name))
        }
    }

    /// Returns true if `self` equals `prefix` or lies below it.
    #[must_use]
    pub fn starts_with(&self, prefix: &SyncPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0 || self.0.starts_with(&format!("{}/", prefix.0))
    }

    /// Rewrites the leading `old` prefix to `new`.
    ///
    /// Used when a directory rename re-parents its subtree.
    pub fn reparent(&self, old: &SyncPath, new: &SyncPath) -> Result<Self, DomainError> {
        if !self.starts_with(old) {
            return Err(DomainError::InvalidPath(format!(
                "{:?} is not below {:?}",
                self.0, old.0
            )));
        }
        if self.0 == old.0 {
            return Ok(new.clone());
        }
        let rest = &self.0[old.0.len() + usize::from(!old.is_root())..];
        if new.is_root() {
            Self::new(rest)
        } else {
            Self::new(format!("{}/{}", new.0, rest))
        }
    }

    /// Number of components; 0 for the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('/').count()
        }
    }

    /// All strict ancestors of the path, nearest first, excluding the root.
    #[must_use]
    pub fn ancestors(&self) -> Vec<SyncPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            if p.is_root() {
                break;
            }
            current = p.parent();
            out.push(p);
        }
        out
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// FileId
// ============================================================================

/// A server-assigned file identifier, stable across renames.
///
/// File ids are opaque and may legitimately be duplicated within the tree
/// when the server shares content between locations, so move detection must
/// not assume uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidId("empty file id".to_string()));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sentinel for entries whose server omitted the id header; replaced
    /// by the real id on the next directory read.
    #[must_use]
    pub fn unknown() -> Self {
        Self("-".to_string())
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ETag
// ============================================================================

/// A server-assigned version token.
///
/// The reserved value [`ETag::INVALID`] is stored for directories whose
/// propagation did not complete, forcing rediscovery of that subtree on the
/// next run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// The reserved marker for directories that need remote rediscovery.
    pub const INVALID: &'static str = "_invalid_";

    pub fn new(etag: impl Into<String>) -> Result<Self, DomainError> {
        let etag = etag.into();
        if etag.is_empty() {
            return Err(DomainError::InvalidId("empty etag".to_string()));
        }
        Ok(Self(etag))
    }

    /// The rediscovery marker value.
    #[must_use]
    pub fn invalid() -> Self {
        Self(Self::INVALID.to_string())
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_path_root() {
        let root = SyncPath::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_sync_path_rejects_absolute() {
        assert!(SyncPath::new("/a/b").is_err());
        assert!(SyncPath::new("a/b/").is_err());
        assert!(SyncPath::new("a//b").is_err());
        assert!(SyncPath::new("a/../b").is_err());
    }

    #[test]
    fn test_sync_path_components() {
        let p = SyncPath::new("A/sub/file.txt").unwrap();
        assert_eq!(p.file_name(), "file.txt");
        assert_eq!(p.parent().unwrap().as_str(), "A/sub");
        assert_eq!(p.depth(), 3);
    }

    #[test]
    fn test_sync_path_join() {
        let p = SyncPath::new("A").unwrap().join("b.txt").unwrap();
        assert_eq!(p.as_str(), "A/b.txt");
        assert_eq!(SyncPath::root().join("x").unwrap().as_str(), "x");
        assert!(SyncPath::root().join("a/b").is_err());
    }

    #[test]
    fn test_sync_path_starts_with() {
        let p = SyncPath::new("A/b/c").unwrap();
        assert!(p.starts_with(&SyncPath::new("A").unwrap()));
        assert!(p.starts_with(&SyncPath::new("A/b").unwrap()));
        assert!(p.starts_with(&SyncPath::root()));
        assert!(!p.starts_with(&SyncPath::new("A/bc").unwrap()));
    }

    #[test]
    fn test_sync_path_reparent() {
        let p = SyncPath::new("A/b/c").unwrap();
        let moved = p
            .reparent(&SyncPath::new("A").unwrap(), &SyncPath::new("X/Y").unwrap())
            .unwrap();
        assert_eq!(moved.as_str(), "X/Y/b/c");

        let same = SyncPath::new("A").unwrap();
        let renamed = same
            .reparent(&SyncPath::new("A").unwrap(), &SyncPath::new("B").unwrap())
            .unwrap();
        assert_eq!(renamed.as_str(), "B");
    }

    #[test]
    fn test_sync_path_ancestors() {
        let p = SyncPath::new("A/b/c").unwrap();
        let ancestors: Vec<String> = p
            .ancestors()
            .into_iter()
            .map(|a| a.as_str().to_string())
            .collect();
        assert_eq!(ancestors, vec!["A/b".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_etag_invalid_marker() {
        let etag = ETag::invalid();
        assert!(etag.is_invalid());
        assert_eq!(etag.as_str(), "_invalid_");
        assert!(!ETag::new("abc123").unwrap().is_invalid());
    }

    #[test]
    fn test_file_id_rejects_empty() {
        assert!(FileId::new("").is_err());
        assert_eq!(FileId::new("00001").unwrap().as_str(), "00001");
    }
}
