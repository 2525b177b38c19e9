use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::BlockError;
use crate::fs::Mutation;
use crate::types::{Block, BlockId};
use crate::wire::MAX_BLOCK_LEN;

/// BlockRequest is what the filesystem asks of the manager.
#[derive(Debug)]
pub enum BlockRequest {
    Put {
        block: Block,
        reply: oneshot::Sender<Result<(), BlockError>>,
    },
    Get {
        block_id: BlockId,
        reply: oneshot::Sender<Result<Block, BlockError>>,
    },
    /// Send a tree mutation to every connected peer.
    Broadcast(Mutation),
    /// Drop local replicas of a block no entry references any more.
    Collect(BlockId),
}

/// BlockClient is the filesystem's handle on the block pipeline.
#[derive(Clone, Debug)]
pub struct BlockClient {
    tx: mpsc::Sender<BlockRequest>,
}

impl BlockClient {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<BlockRequest>) -> Self {
        Self { tx }
    }

    /// `put` stores `block` on every write replica.
    ///
    /// # Errors
    /// Returns `TooLarge` for blocks no peer could receive, the first replica
    /// failure, or `Stopped` if the manager is gone.
    pub async fn put(&self, block: Block) -> Result<(), BlockError> {
        check_block_len(block.data.len())?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BlockRequest::Put { block, reply })
            .await
            .map_err(|_| BlockError::Stopped)?;
        rx.await.map_err(|_| BlockError::Stopped)?
    }

    /// `get` fetches a block, falling back across replicas.
    ///
    /// # Errors
    /// Returns the last replica failure, or `Stopped` if the manager is gone.
    pub async fn get(&self, block_id: BlockId) -> Result<Block, BlockError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BlockRequest::Get { block_id, reply })
            .await
            .map_err(|_| BlockError::Stopped)?;
        rx.await.map_err(|_| BlockError::Stopped)?
    }

    pub async fn broadcast(&self, mutation: Mutation) {
        if self.tx.send(BlockRequest::Broadcast(mutation)).await.is_err() {
            warn!("fs: broadcast dropped, manager stopped");
        }
    }

    pub async fn collect(&self, block_id: BlockId) {
        if self.tx.send(BlockRequest::Collect(block_id)).await.is_err() {
            warn!("fs: block collection dropped, manager stopped");
        }
    }
}

fn check_block_len(len: usize) -> Result<(), BlockError> {
    if len > MAX_BLOCK_LEN {
        return Err(BlockError::TooLarge(len));
    }
    Ok(())
}
