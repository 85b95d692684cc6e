//! Serving blocks to a peer that requested them.
//!
//! Requests we can't honour are dropped without an answer, the connection
//! stays open.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::{
    error::Error,
    extensions::{Block, BlockInfo, Core, BLOCK_LEN},
};

use super::PeerCtx;

impl PeerCtx {
    /// Answer a `Request` with a `Piece`, if the request is acceptable.
    pub async fn serve_request(&self, info: BlockInfo) -> Result<(), Error> {
        let remote = self.remote_addr;
        let index = info.index as usize;

        if !self.peer_interested.load(Ordering::Acquire) {
            debug!("{remote} requested {info:?} but is not interested");
            return Ok(());
        }
        if self.am_choking.load(Ordering::Acquire) {
            debug!("{remote} requested {info:?} while choked");
            return Ok(());
        }
        if !self.session.has_piece(index).await {
            debug!("{remote} requested piece {index} that we don't have");
            return Ok(());
        }
        if info.len == 0 || info.len > BLOCK_LEN {
            debug!("{remote} requested a block of {} bytes", info.len);
            return Ok(());
        }
        let piece_len = self.session.piece_len(index) as u64;
        if info.begin as u64 + info.len as u64 > piece_len {
            debug!("{remote} requested past the end of piece {index}");
            return Ok(());
        }

        let data = match self.session.read_block(index, info.begin, info.len).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("{remote} short read of {info:?}");
                return Ok(());
            }
            Err(e) => {
                debug!("{remote} could not read {info:?}: {e}");
                return Ok(());
            }
        };

        self.session.counter.record_upload(data.len() as u64);

        self.send(Core::Piece(Block {
            index: info.index,
            begin: info.begin,
            block: data,
        }))
    }
}
