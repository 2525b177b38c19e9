//! Identifier and value types shared by every layer of the node.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// `generate` returns a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// NodeId names one process in the cluster.
    NodeId
);
string_id!(
    /// DiskId names one attached on-disk directory.
    DiskId
);
string_id!(
    /// BlockId names the single content block owned by a file.
    BlockId
);
string_id!(
    /// PutBlockId correlates an in-flight block write with its replies.
    PutBlockId
);
string_id!(
    /// GetBlockId correlates an in-flight block read with its replies.
    GetBlockId
);

/// ConnId is a process-local handle for one peer connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// DiskPointer is the canonical address of one replica of one block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiskPointer {
    pub node_id: NodeId,
    pub disk_id: DiskId,
    pub file_name: String,
}

impl DiskPointer {
    #[must_use]
    pub fn new(node_id: NodeId, disk_id: DiskId, block_id: &BlockId) -> Self {
        Self {
            node_id,
            disk_id,
            file_name: block_id.0.clone(),
        }
    }

    /// `block_id` recovers the block addressed by this pointer.
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        BlockId(self.file_name.clone())
    }
}

impl fmt::Display for DiskPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node_id, self.disk_id, self.file_name)
    }
}

/// Block is the whole payload of one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub data: Vec<u8>,
}

impl Block {
    #[must_use]
    pub const fn new(id: BlockId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    #[must_use]
    pub const fn empty(id: BlockId) -> Self {
        Self {
            id,
            data: Vec::new(),
        }
    }
}

/// DiskInfo advertises one local disk and its placement weight in an I-AM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskInfo {
    pub disk_id: DiskId,
    pub weight: u32,
}
