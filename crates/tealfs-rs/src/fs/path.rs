use std::fmt;

use crate::error::{FsError, FsResult};

/// FsPath is a '/'-separated path held as its segments. The root is the
/// empty segment list.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsPath(Vec<String>);

impl FsPath {
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// `parse` tokenizes a path string.
    ///
    /// Empty and `.` segments are skipped, so `"/a//b/"` equals `"a/b"`.
    ///
    /// # Errors
    /// Returns `InvalidPath` for `..` segments and NUL bytes.
    pub fn parse(raw: &str) -> FsResult<Self> {
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(FsError::InvalidPath(format!(
                        "{raw}: parent directory references are not supported"
                    )));
                }
                name if name.contains('\0') => {
                    return Err(FsError::InvalidPath(format!("{raw}: contains NUL")));
                }
                name => segments.push(name.to_string()),
            }
        }
        Ok(Self(segments))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// `base` returns the parent path; the root is its own base.
    #[must_use]
    pub fn base(&self) -> Self {
        match self.0.split_last() {
            Some((_, parent)) => Self(parent.to_vec()),
            None => Self::root(),
        }
    }

    /// `name` returns the last segment, or an empty string for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }

    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Self(segments)
    }

    /// `starts_with` is segment-wise: `/ab` does not start with `/a`.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// `is_child_of` holds when `parent` is exactly one level up.
    #[must_use]
    pub fn is_child_of(&self, parent: &Self) -> bool {
        self.depth() == parent.depth() + 1 && self.starts_with(parent)
    }

    /// `replace_prefix` swaps a leading `from` for `to`.
    #[must_use]
    pub fn replace_prefix(&self, from: &Self, to: &Self) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let mut segments = to.0.clone();
        segments.extend_from_slice(&self.0[from.depth()..]);
        Some(Self(segments))
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_separators() {
        let path = FsPath::parse("//docs/./notes//a.txt/").unwrap();
        assert_eq!(path.segments(), ["docs", "notes", "a.txt"]);
        assert_eq!(path.to_string(), "/docs/notes/a.txt");
        assert!(FsPath::parse("/").unwrap().is_root());
    }

    #[test]
    fn parse_rejects_parent_references() {
        assert!(matches!(
            FsPath::parse("/a/../b"),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn prefix_checks_are_segment_wise() {
        let a = FsPath::parse("/a").unwrap();
        let ab = FsPath::parse("/ab").unwrap();
        let a_b = FsPath::parse("/a/b").unwrap();
        assert!(!ab.starts_with(&a));
        assert!(a_b.starts_with(&a));
        assert!(a_b.is_child_of(&a));
        assert_eq!(a_b.base(), a);
        assert_eq!(a_b.name(), "b");
    }

    #[test]
    fn replace_prefix_moves_subtree() {
        let from = FsPath::parse("/old").unwrap();
        let to = FsPath::parse("/new/place").unwrap();
        let moved = FsPath::parse("/old/x/y")
            .unwrap()
            .replace_prefix(&from, &to)
            .unwrap();
        assert_eq!(moved.to_string(), "/new/place/x/y");
        assert!(FsPath::parse("/other").unwrap().replace_prefix(&from, &to).is_none());
    }
}
