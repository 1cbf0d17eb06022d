//! Bounded decompression worker pool
//!
//! Decompression is CPU-bound. Running it on the async worker that owns a
//! connection would stall every other connection scheduled there, so bodies
//! are decoded on the blocking thread pool with at most `workers` decodes in
//! progress at once.

use std::sync::Arc;

use tokio::sync::Semaphore;
use zipseed_chunks::PieceCodec;
use zipseed_core::{ZipseedError, ZipseedResult};

use crate::reassembly::{decode_piece, PieceBody, ReassembledBlock};

#[derive(Clone)]
pub struct DecompressPool {
    codec: Arc<dyn PieceCodec>,
    permits: Arc<Semaphore>,
    workers: usize,
    block_size: u32,
}

impl DecompressPool {
    pub fn new(codec: Arc<dyn PieceCodec>, workers: usize, block_size: u32) -> Self {
        let workers = workers.max(1);
        Self {
            codec,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            block_size,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Decodes not currently running.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Decompress and slice `body` off the async executor.
    pub async fn decode(&self, body: PieceBody) -> ZipseedResult<Vec<ReassembledBlock>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ZipseedError::Other(anyhow::anyhow!("decompress pool closed: {e}")))?;
        let codec = self.codec.clone();
        let block_size = self.block_size;
        let piece = body.request.piece;

        tokio::task::spawn_blocking(move || {
            let _permit = permit; // released when the decode finishes
            decode_piece(codec.as_ref(), &body.request, &body.body, block_size)
                .map_err(ZipseedError::from)
        })
        .await
        .map_err(|e| {
            ZipseedError::Other(anyhow::anyhow!("decompress task for piece {piece} failed: {e}"))
        })?
    }
}
