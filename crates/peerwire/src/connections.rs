//! Live connections of each torrent, used to fan out messages to the
//! siblings of a connection.

use std::{net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    extensions::{Core, ExtensionKind, Pex},
    peer::PeerCtx,
    torrent::InfoHash,
};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<InfoHash, Vec<Arc<PeerCtx>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a previous connection with the same remote address.
    pub async fn register(&self, ctx: Arc<PeerCtx>) {
        let mut conns = self.conns.write().await;
        let list = conns.entry(ctx.info_hash()).or_default();
        list.retain(|c| c.remote_addr != ctx.remote_addr);
        list.push(ctx);
    }

    pub async fn unregister(&self, info_hash: InfoHash, addr: SocketAddr) {
        let mut conns = self.conns.write().await;
        if let Some(list) = conns.get_mut(&info_hash) {
            list.retain(|c| c.remote_addr != addr);
            if list.is_empty() {
                conns.remove(&info_hash);
            }
        }
    }

    pub async fn connections(&self, info_hash: InfoHash) -> Vec<Arc<PeerCtx>> {
        self.conns.read().await.get(&info_hash).cloned().unwrap_or_default()
    }

    /// If a connection to `addr` exists, by its socket address or by the
    /// address the peer listens on.
    pub async fn is_connected(&self, info_hash: InfoHash, addr: &SocketAddr) -> bool {
        for ctx in self.connections(info_hash).await {
            if ctx.remote_addr == *addr || ctx.listen_addr().await == Some(*addr) {
                return true;
            }
        }
        false
    }

    pub async fn count(&self, info_hash: InfoHash) -> usize {
        self.conns.read().await.get(&info_hash).map_or(0, |l| l.len())
    }

    /// Send `Have` to every connection of the torrent but `except`.
    pub async fn broadcast_have(
        &self,
        info_hash: InfoHash,
        piece: u32,
        except: Option<SocketAddr>,
    ) {
        for ctx in self.connections(info_hash).await {
            if Some(ctx.remote_addr) == except || ctx.is_closed() {
                continue;
            }
            debug!("{} > have {piece}", ctx.remote_addr);
            let _ = ctx.send(Core::Have(piece));
        }
    }

    /// Gossip `peers` to every connection that negotiated PEX, skipping the
    /// peers we are already connected to.
    pub async fn broadcast_new_peers(&self, info_hash: InfoHash, peers: &[SocketAddr]) {
        let mut added = Vec::with_capacity(peers.len());
        for peer in peers {
            if !self.is_connected(info_hash, peer).await {
                added.push(*peer);
            }
        }
        if added.is_empty() {
            return;
        }

        let pex = Pex { added, dropped: Vec::new() };

        for ctx in self.connections(info_hash).await {
            if ctx.is_closed() || !ctx.supports(ExtensionKind::Pex).await {
                continue;
            }
            if let Err(e) = ctx.send_pex(&pex).await {
                debug!("{} could not gossip peers: {e}", ctx.remote_addr);
            }
        }
    }

    /// Every connection but `except` sends its own PEX update.
    pub async fn broadcast_pex_update(&self, info_hash: InfoHash, except: Option<SocketAddr>) {
        for ctx in self.connections(info_hash).await {
            if Some(ctx.remote_addr) == except || ctx.is_closed() {
                continue;
            }
            if let Err(e) = ctx.send_pex_update().await {
                debug!("{} pex update failed: {e}", ctx.remote_addr);
            }
        }
    }

    /// Close every connection of the torrent.
    pub async fn close_all(&self, info_hash: InfoHash) {
        for ctx in self.connections(info_hash).await {
            ctx.close().await;
        }
    }
}
