//! Shared state of the client, handed to every connection and job.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::{
    connections::ConnectionRegistry, error::Error, swarm::SwarmRegistry,
    torrent::{InfoHash, TorrentSession},
};

#[derive(Debug, Default)]
pub struct Registries {
    pub swarm: SwarmRegistry,
    pub connections: ConnectionRegistry,
    /// Torrents that inbound connections may ask for.
    sessions: RwLock<HashMap<InfoHash, Arc<TorrentSession>>>,
}

impl Registries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add_session(&self, session: Arc<TorrentSession>) -> Result<(), Error> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }
        sessions.insert(session.info_hash, session);
        Ok(())
    }

    pub async fn session(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.sessions.read().await.get(info_hash).cloned()
    }

    pub async fn sessions(&self) -> Vec<Arc<TorrentSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Forget the torrent, closing its connections.
    pub async fn remove_session(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        let session = self.sessions.write().await.remove(info_hash);
        self.connections.close_all(*info_hash).await;
        self.swarm.remove_torrent(*info_hash).await;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Info;

    #[tokio::test]
    async fn sessions_are_unique() {
        let registries = Registries::new();
        let info = Info::from_data("a", 16, &[0u8; 20]).unwrap();
        let hash = info.info_hash;
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(TorrentSession::new(info, dir.path(), vec![]).unwrap());

        registries.add_session(session.clone()).await.unwrap();
        assert!(matches!(
            registries.add_session(session).await,
            Err(Error::NoDuplicateTorrent)
        ));
        assert!(registries.session(&hash).await.is_some());

        registries.remove_session(&hash).await;
        assert!(registries.session(&hash).await.is_none());
    }
}
