use std::time::{SystemTime, UNIX_EPOCH};

use super::path::FsPath;
use crate::types::BlockId;

/// MODE_DIR marks a directory entry inside `File::mode`.
pub const MODE_DIR: u32 = 0x8000_0000;
/// DEFAULT_DIR_MODE is used for the synthesized root entry.
pub const DEFAULT_DIR_MODE: u32 = MODE_DIR | 0o755;

/// File is one entry in the filesystem index. Directories own a block too,
/// but it never carries data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    pub path: FsPath,
    pub size: u64,
    pub mode: u32,
    /// Seconds since the unix epoch.
    pub modtime: i64,
    pub block_id: BlockId,
}

impl File {
    #[must_use]
    pub fn new_file(path: FsPath, mode: u32) -> Self {
        Self {
            path,
            size: 0,
            mode: mode & !MODE_DIR,
            modtime: unix_now(),
            block_id: BlockId::generate(),
        }
    }

    #[must_use]
    pub fn new_dir(path: FsPath, mode: u32) -> Self {
        Self {
            path,
            size: 0,
            mode: mode | MODE_DIR,
            modtime: unix_now(),
            block_id: BlockId::generate(),
        }
    }

    #[must_use]
    pub fn root() -> Self {
        Self {
            path: FsPath::root(),
            size: 0,
            mode: DEFAULT_DIR_MODE,
            modtime: 0,
            block_id: BlockId::from(""),
        }
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.path.name()
    }
}

/// Mutation is one filesystem-tree change as broadcast to peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Upsert(File),
    Delete(File),
}

impl Mutation {
    #[must_use]
    pub const fn file(&self) -> &File {
        match self {
            Self::Upsert(file) | Self::Delete(file) => file,
        }
    }
}

#[must_use]
pub fn unix_now() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(dur.as_secs()).unwrap_or(i64::MAX)
}
