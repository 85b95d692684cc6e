//! Addresses of the peers of each torrent, as learned from trackers and PEX.

use std::{net::SocketAddr, time::Duration};

use hashbrown::{HashMap, HashSet};
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

use crate::torrent::InfoHash;

/// A peer is not gossiped again to the same requester within this window.
pub const PEX_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Peers of one torrent. `known` keeps insertion order so that candidates
/// are handed out in the order they were learned.
#[derive(Debug, Default)]
struct SwarmState {
    known: Vec<SocketAddr>,
    active: HashSet<SocketAddr>,
    dropped: Vec<SocketAddr>,
    /// requester -> (peer -> last time it was sent to the requester)
    pex_sent: HashMap<SocketAddr, HashMap<SocketAddr, Instant>>,
}

impl SwarmState {
    fn is_known(&self, addr: &SocketAddr) -> bool {
        self.known.contains(addr)
    }

    fn learn(&mut self, addr: SocketAddr) -> bool {
        self.dropped.retain(|v| *v != addr);
        if self.is_known(&addr) {
            return false;
        }
        self.known.push(addr);
        true
    }
}

#[derive(Debug, Default)]
pub struct SwarmRegistry {
    swarms: RwLock<HashMap<InfoHash, SwarmState>>,
    /// Addresses this client listens on, they are never stored.
    local: RwLock<HashSet<SocketAddr>>,
}

impl SwarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_local_addr(&self, addr: SocketAddr) {
        self.local.write().await.insert(addr);
    }

    async fn is_local(&self, addr: &SocketAddr) -> bool {
        self.local.read().await.contains(addr)
    }

    /// Peers returned by a tracker announce.
    pub async fn register_tracker_peers(
        &self,
        info_hash: InfoHash,
        peers: &[SocketAddr],
    ) -> usize {
        self.learn_all(info_hash, peers).await.len()
    }

    /// Peers added by a PEX message, returns the ones that were not known.
    pub async fn on_pex_peers_discovered(
        &self,
        info_hash: InfoHash,
        added: &[SocketAddr],
    ) -> Vec<SocketAddr> {
        self.learn_all(info_hash, added).await
    }

    async fn learn_all(
        &self,
        info_hash: InfoHash,
        peers: &[SocketAddr],
    ) -> Vec<SocketAddr> {
        let local = self.local.read().await.clone();
        let mut swarms = self.swarms.write().await;
        let swarm = swarms.entry(info_hash).or_default();

        let new: Vec<SocketAddr> = peers
            .iter()
            .filter(|addr| !local.contains(*addr))
            .filter(|addr| swarm.learn(**addr))
            .copied()
            .collect();

        debug!("{info_hash:?} learned {} new peers", new.len());
        new
    }

    pub async fn register_active_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
        if self.is_local(&addr).await {
            return;
        }
        let mut swarms = self.swarms.write().await;
        let swarm = swarms.entry(info_hash).or_default();
        swarm.learn(addr);
        swarm.active.insert(addr);
    }

    pub async fn unregister_active_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
        let mut swarms = self.swarms.write().await;
        let Some(swarm) = swarms.get_mut(&info_hash) else {
            return;
        };
        swarm.active.remove(&addr);
        if swarm.is_known(&addr) && !swarm.dropped.contains(&addr) {
            swarm.dropped.push(addr);
        }
    }

    /// Up to `max` known peers that we are not connected to.
    pub async fn acquire_peers(&self, info_hash: InfoHash, max: usize) -> Vec<SocketAddr> {
        let swarms = self.swarms.read().await;
        let Some(swarm) = swarms.get(&info_hash) else {
            return Vec::new();
        };
        swarm
            .known
            .iter()
            .filter(|addr| !swarm.active.contains(*addr))
            .take(max)
            .copied()
            .collect()
    }

    /// Peers to gossip to `requester`, skipping the ones it got within the
    /// last [`PEX_DEDUP_WINDOW`].
    pub async fn peers_for_pex(
        &self,
        info_hash: InfoHash,
        requester: SocketAddr,
        exclude: &[SocketAddr],
        max: usize,
    ) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut swarms = self.swarms.write().await;
        let Some(swarm) = swarms.get_mut(&info_hash) else {
            return Vec::new();
        };

        let sent = swarm.pex_sent.entry(requester).or_default();
        sent.retain(|_, at| now.duration_since(*at) < PEX_DEDUP_WINDOW);

        let peers: Vec<SocketAddr> = swarm
            .known
            .iter()
            .filter(|addr| !swarm.active.contains(*addr))
            .filter(|addr| !exclude.contains(addr))
            .filter(|addr| **addr != requester && !sent.contains_key(*addr))
            .take(max)
            .copied()
            .collect();

        for addr in &peers {
            sent.insert(*addr, now);
        }

        peers
    }

    /// Drain up to `max` dropped peers, each one is returned only once.
    pub async fn dropped_peers(&self, info_hash: InfoHash, max: usize) -> Vec<SocketAddr> {
        let mut swarms = self.swarms.write().await;
        let Some(swarm) = swarms.get_mut(&info_hash) else {
            return Vec::new();
        };
        let n = max.min(swarm.dropped.len());
        swarm.dropped.drain(..n).collect()
    }

    pub async fn is_known(&self, info_hash: InfoHash, addr: &SocketAddr) -> bool {
        self.swarms
            .read()
            .await
            .get(&info_hash)
            .is_some_and(|s| s.is_known(addr))
    }

    pub async fn is_active(&self, info_hash: InfoHash, addr: &SocketAddr) -> bool {
        self.swarms
            .read()
            .await
            .get(&info_hash)
            .is_some_and(|s| s.active.contains(addr))
    }

    pub async fn known_count(&self, info_hash: InfoHash) -> usize {
        self.swarms.read().await.get(&info_hash).map_or(0, |s| s.known.len())
    }

    pub async fn active_count(&self, info_hash: InfoHash) -> usize {
        self.swarms.read().await.get(&info_hash).map_or(0, |s| s.active.len())
    }

    pub async fn remove_torrent(&self, info_hash: InfoHash) {
        self.swarms.write().await.remove(&info_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    const HASH: InfoHash = InfoHash([1u8; 20]);

    #[tokio::test]
    async fn tracker_peers_skip_local() {
        let swarm = SwarmRegistry::new();
        swarm.add_local_addr(addr(6881)).await;

        let n = swarm
            .register_tracker_peers(HASH, &[addr(1), addr(6881), addr(2), addr(1)])
            .await;
        assert_eq!(n, 2);
        assert_eq!(swarm.known_count(HASH).await, 2);
        assert!(!swarm.is_known(HASH, &addr(6881)).await);
    }

    #[tokio::test]
    async fn active_and_dropped_are_disjoint() {
        let swarm = SwarmRegistry::new();
        swarm.register_tracker_peers(HASH, &[addr(1), addr(2)]).await;

        swarm.register_active_peer(HASH, addr(1)).await;
        assert_eq!(swarm.acquire_peers(HASH, 10).await, vec![addr(2)]);

        swarm.unregister_active_peer(HASH, addr(1)).await;
        assert!(!swarm.is_active(HASH, &addr(1)).await);

        // connecting again removes it from the dropped set
        swarm.register_active_peer(HASH, addr(1)).await;
        assert!(swarm.dropped_peers(HASH, 10).await.is_empty());
    }

    #[tokio::test]
    async fn dropped_is_delivered_once() {
        let swarm = SwarmRegistry::new();
        swarm.register_tracker_peers(HASH, &[addr(1), addr(2), addr(3)]).await;
        for port in 1..=3 {
            swarm.register_active_peer(HASH, addr(port)).await;
            swarm.unregister_active_peer(HASH, addr(port)).await;
        }

        assert_eq!(swarm.dropped_peers(HASH, 2).await, vec![addr(1), addr(2)]);
        assert_eq!(swarm.dropped_peers(HASH, 2).await, vec![addr(3)]);
        assert!(swarm.dropped_peers(HASH, 2).await.is_empty());
    }

    #[tokio::test]
    async fn pex_discovery_returns_new_peers() {
        let swarm = SwarmRegistry::new();
        swarm.register_tracker_peers(HASH, &[addr(1)]).await;

        let new = swarm.on_pex_peers_discovered(HASH, &[addr(1), addr(2)]).await;
        assert_eq!(new, vec![addr(2)]);
    }

    #[tokio::test]
    async fn pex_dedup_window() {
        let swarm = SwarmRegistry::new();
        let peers: Vec<SocketAddr> = (1..=6).map(addr).collect();
        swarm.register_tracker_peers(HASH, &peers).await;

        let requester = addr(100);
        let exclude = [addr(1)];

        let first = swarm.peers_for_pex(HASH, requester, &exclude, 3).await;
        assert_eq!(first, vec![addr(2), addr(3), addr(4)]);

        let second = swarm.peers_for_pex(HASH, requester, &exclude, 3).await;
        assert_eq!(second, vec![addr(5), addr(6)]);
        assert!(first.iter().all(|p| !second.contains(p)));

        assert!(swarm.peers_for_pex(HASH, requester, &exclude, 3).await.is_empty());

        // another requester has its own window
        let other = swarm.peers_for_pex(HASH, addr(200), &exclude, 10).await;
        assert_eq!(other.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn pex_window_expires() {
        let swarm = SwarmRegistry::new();
        swarm.register_tracker_peers(HASH, &[addr(1)]).await;

        assert_eq!(swarm.peers_for_pex(HASH, addr(100), &[], 5).await.len(), 1);
        assert!(swarm.peers_for_pex(HASH, addr(100), &[], 5).await.is_empty());

        tokio::time::advance(PEX_DEDUP_WINDOW + Duration::from_secs(1)).await;
        assert_eq!(swarm.peers_for_pex(HASH, addr(100), &[], 5).await.len(), 1);
    }
}
