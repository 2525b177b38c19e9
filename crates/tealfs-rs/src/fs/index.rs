//! The path -> entry map and its tree invariants.

use std::collections::BTreeMap;

use super::file::{File, Mutation};
use super::path::FsPath;
use crate::error::{FsError, FsResult};
use crate::types::BlockId;

/// FileIndex keeps every entry keyed by path. Segment-wise ordering keeps a
/// directory's descendants contiguous right after it.
#[derive(Debug, Default, Clone)]
pub struct FileIndex {
    files: BTreeMap<FsPath, File>,
}

impl FileIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_files(files: Vec<File>) -> Self {
        Self {
            files: files.into_iter().map(|f| (f.path.clone(), f)).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = &File> {
        self.files.values()
    }

    #[must_use]
    pub fn get(&self, path: &FsPath) -> Option<&File> {
        self.files.get(path)
    }

    /// `stat` returns the entry at `path`; the root is always a directory.
    ///
    /// # Errors
    /// Returns `NotFound` when no entry exists.
    pub fn stat(&self, path: &FsPath) -> FsResult<File> {
        if path.is_root() {
            return Ok(File::root());
        }
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// `mkdir` inserts a directory entry.
    ///
    /// # Errors
    /// Fails when the path exists, the base is missing or not a directory.
    pub fn mkdir(&mut self, path: &FsPath, mode: u32) -> FsResult<File> {
        self.check_new_entry(path)?;
        let dir = File::new_dir(path.clone(), mode);
        self.files.insert(path.clone(), dir.clone());
        Ok(dir)
    }

    /// `create` inserts an empty file entry with a fresh block id.
    ///
    /// # Errors
    /// Fails when the path exists, the base is missing or not a directory.
    pub fn create(&mut self, path: &FsPath, mode: u32) -> FsResult<File> {
        self.check_new_entry(path)?;
        let file = File::new_file(path.clone(), mode);
        self.files.insert(path.clone(), file.clone());
        Ok(file)
    }

    /// `upsert` replaces whatever lives at the entry's path.
    pub fn upsert(&mut self, file: File) {
        self.files.insert(file.path.clone(), file);
    }

    /// `rename` moves `old` (and for directories every descendant) under `new`.
    /// Block ids travel with their entries. Returns `(before, after)` pairs.
    ///
    /// # Errors
    /// Fails when `old` is missing, `new` exists, `new`'s base is not a
    /// directory, or `new` lies inside `old`.
    pub fn rename(&mut self, old: &FsPath, new: &FsPath) -> FsResult<Vec<(File, File)>> {
        if old.is_root() || new.is_root() {
            return Err(FsError::InvalidPath("cannot rename the root".to_string()));
        }
        if !self.files.contains_key(old) {
            return Err(FsError::NotFound(old.to_string()));
        }
        if old == new {
            return Ok(Vec::new());
        }
        if new.starts_with(old) {
            return Err(FsError::InvalidPath(format!(
                "{new} is inside {old}"
            )));
        }
        self.check_new_entry(new)?;

        let moved: Vec<File> = self.subtree(old).cloned().collect();
        let mut pairs = Vec::with_capacity(moved.len());
        for before in moved {
            self.files.remove(&before.path);
            let Some(path) = before.path.replace_prefix(old, new) else {
                continue;
            };
            let after = File {
                path,
                ..before.clone()
            };
            pairs.push((before, after));
        }
        for (_, after) in &pairs {
            self.files.insert(after.path.clone(), after.clone());
        }
        Ok(pairs)
    }

    /// `remove_all` deletes `path` and every descendant, returning what was
    /// removed. Missing paths remove nothing.
    pub fn remove_all(&mut self, path: &FsPath) -> Vec<File> {
        let doomed: Vec<FsPath> = self.subtree(path).map(|f| f.path.clone()).collect();
        doomed
            .iter()
            .filter_map(|p| self.files.remove(p))
            .collect()
    }

    /// `children` lists the immediate children of a directory.
    ///
    /// # Errors
    /// Returns `NotFound` for missing paths and `NotADirectory` for files.
    pub fn children(&self, path: &FsPath) -> FsResult<Vec<File>> {
        if !path.is_root() {
            match self.files.get(path) {
                None => return Err(FsError::NotFound(path.to_string())),
                Some(entry) if !entry.is_dir() => {
                    return Err(FsError::NotADirectory(path.to_string()));
                }
                Some(_) => {}
            }
        }
        Ok(self
            .subtree(path)
            .filter(|f| f.path.is_child_of(path))
            .cloned()
            .collect())
    }

    /// `apply` replays a mutation received from a peer and returns the entry
    /// it displaced, if any.
    pub fn apply(&mut self, mutation: &Mutation) -> Option<File> {
        match mutation {
            Mutation::Upsert(file) => self.files.insert(file.path.clone(), file.clone()),
            Mutation::Delete(file) => self.files.remove(&file.path),
        }
    }

    #[must_use]
    pub fn references(&self, block_id: &BlockId) -> bool {
        self.files.values().any(|f| &f.block_id == block_id)
    }

    fn subtree<'a>(&'a self, path: &'a FsPath) -> impl Iterator<Item = &'a File> + 'a {
        self.files
            .range(path.clone()..)
            .take_while(move |(p, _)| p.starts_with(path))
            .map(|(_, f)| f)
    }

    fn check_new_entry(&self, path: &FsPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        if self.files.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let base = path.base();
        if base.is_root() {
            return Ok(());
        }
        match self.files.get(&base) {
            None => Err(FsError::MissingParent(path.to_string())),
            Some(parent) if !parent.is_dir() => Err(FsError::NotADirectory(base.to_string())),
            Some(_) => Ok(()),
        }
    }
}
