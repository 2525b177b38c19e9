//! Clustered, content-addressed block storage with a replicated filesystem
//! namespace on top.
#![allow(clippy::cargo_common_metadata)]

pub mod config;
pub mod conn;
pub mod disk;
pub mod error;
pub mod fs;
pub mod manager;
pub mod mapper;
pub mod node;
pub mod placement;
pub mod reconnect;
pub mod types;
pub mod wire;

pub use config::NodeConfig;
pub use error::{BlockError, FsError, FsResult};
pub use fs::{File, FileHandle, FileSystem, FsPath, OpenOptions};
pub use manager::PeerStatus;
pub use node::Node;
pub use types::{BlockId, DiskId, NodeId};
