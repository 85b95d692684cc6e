//! The worker task of a [`DownloadJob`].

use std::{net::SocketAddr, sync::Arc};

use futures::future::join_all;
use tokio::{select, sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    bitfield::BitfieldExt,
    error::Error,
    peer::{PeerConnection, PeerOptions},
    registries::Registries,
    torrent::InfoHash,
    tracker::{event::Event, AnnounceRequest, Announcer},
};

use super::{
    DownloadJob, Status, DISCOVERY_BATCH, DISCOVERY_EVERY, INITIAL_PEERS,
    MIN_KNOWN_PEERS,
};

/// Drives one [`DownloadJob`] until the file is complete, the job is
/// cancelled, or no peer can provide the missing pieces.
pub struct DownloadTask {
    job: Arc<DownloadJob>,
    registries: Arc<Registries>,
    announcer: Arc<dyn Announcer>,
    opts: PeerOptions,
    max_peers: usize,
    /// Outbound connections of this job, in the order they were opened.
    pool: Vec<Arc<PeerConnection>>,
    cancel: watch::Receiver<bool>,
}

impl DownloadTask {
    pub fn new(
        job: Arc<DownloadJob>,
        registries: Arc<Registries>,
        announcer: Arc<dyn Announcer>,
        opts: PeerOptions,
        max_peers: usize,
    ) -> Self {
        let cancel = job.subscribe_cancel();
        Self {
            job,
            registries,
            announcer,
            opts,
            max_peers: max_peers.max(1),
            pool: Vec::new(),
            cancel,
        }
    }

    /// Run the task in the background, the handle resolves to the final
    /// status of the job.
    pub fn spawn(self) -> JoinHandle<Status> {
        tokio::spawn(self.run())
    }

    fn info_hash(&self) -> InfoHash {
        self.job.session.info_hash
    }

    #[tracing::instrument(name = "job", skip_all, fields(id = self.job.id))]
    pub async fn run(mut self) -> Status {
        let status = match self.download().await {
            Ok(()) => Status::Completed,
            Err(Error::JobCancelled) => Status::Cancelled,
            Err(e) if e.is_transport() => {
                warn!("no peer could provide the file: {e}");
                Status::TryingToConnect
            }
            Err(e) => {
                error!("download failed: {e}");
                Status::Failed(e.to_string())
            }
        };

        for conn in self.pool.drain(..) {
            conn.close().await;
        }

        info!("job finished with {status}");
        self.job.set_status(status.clone()).await;
        status
    }

    async fn download(&mut self) -> Result<(), Error> {
        self.check_cancel()?;
        let session = self.job.session.clone();

        if session.is_pending() {
            return Err(Error::MetaInfoField("info"));
        }
        session.open_for_download().await?;

        if session.is_complete().await {
            info!("{} is already complete", session.name);
            return Ok(());
        }

        self.ensure_known_peers(false).await;
        self.connect_candidates(INITIAL_PEERS).await;
        if self.pool.is_empty() {
            return Err(Error::NoPeers);
        }

        self.job.set_status(Status::Downloading).await;

        let missing: Vec<usize> = {
            let bitfield = session.bitfield().await;
            (0..session.piece_count()).filter(|i| !bitfield.has(*i)).collect()
        };
        info!("downloading {} pieces of {}", missing.len(), session.name);

        for (n, index) in missing.into_iter().enumerate() {
            self.check_cancel()?;

            if n > 0 && n % DISCOVERY_EVERY == 0 {
                self.ensure_known_peers(false).await;
                self.connect_candidates(DISCOVERY_BATCH).await;
            }

            self.fetch_piece(index).await?;
        }

        if !session.is_complete().await {
            return Err(Error::NoPeers);
        }

        info!("downloaded {}", session.name);
        if let Err(e) = self.announce(Event::Completed).await {
            debug!("completed announce failed: {e}");
        }

        Ok(())
    }

    fn check_cancel(&self) -> Result<(), Error> {
        if *self.cancel.borrow() {
            return Err(Error::JobCancelled);
        }
        Ok(())
    }

    /// Download `index` from the pool, a failing peer is dropped and the
    /// piece is retried on the next one.
    async fn fetch_piece(&mut self, index: usize) -> Result<(), Error> {
        let mut rediscovered = false;
        let mut failures = 0;
        let mut integrity_only = true;

        loop {
            self.check_cancel()?;
            self.pool.retain(|c| !c.is_closed());

            if self.pool.is_empty() {
                if rediscovered {
                    warn!("no peer left for piece {index}");
                    if failures > 0 && integrity_only {
                        return Err(Error::PieceInvalid(index));
                    }
                    return Err(Error::NoPeers);
                }
                rediscovered = true;
                info!("no peers left, looking for more");
                self.ensure_known_peers(true).await;
                self.connect_candidates(INITIAL_PEERS).await;
                continue;
            }

            let conn = self.pick(index).await;
            let addr = conn.remote_addr();

            let mut cancel = self.cancel.clone();
            let r = select! {
                r = conn.download_piece(index) => r,
                _ = cancel.wait_for(|c| *c) => Err(Error::JobCancelled),
            };

            match r {
                Ok(data) => {
                    debug!("piece {index} from {addr}");
                    self.job.record_piece(index, addr, data.len()).await;
                    return Ok(());
                }
                Err(Error::JobCancelled) => return Err(Error::JobCancelled),
                Err(e) => {
                    warn!("piece {index} from {addr} failed: {e}");
                    failures += 1;
                    integrity_only &= e.is_integrity();
                    conn.close().await;
                    self.pool.retain(|c| c.remote_addr() != addr);
                }
            }
        }
    }

    /// Round robin over the connections that have the piece, or over the
    /// whole pool when none of them announced it.
    async fn pick(&self, index: usize) -> Arc<PeerConnection> {
        let mut candidates = Vec::with_capacity(self.pool.len());
        for conn in &self.pool {
            if conn.has_piece(index).await {
                candidates.push(conn.clone());
            }
        }
        if candidates.is_empty() {
            candidates = self.pool.clone();
        }
        candidates[index % candidates.len()].clone()
    }

    async fn announce(&self, event: Event) -> Result<Vec<SocketAddr>, Error> {
        let session = &self.job.session;
        let req = AnnounceRequest {
            info_hash: session.info_hash,
            peer_id: self.opts.local_peer_id.clone(),
            port: self.opts.listen_port,
            downloaded: session.counter.downloaded(),
            uploaded: session.counter.uploaded(),
            left: session.bytes_left().await,
            event,
        };
        Ok(self.announcer.announce(req).await?.peers)
    }

    /// Ask the tracker for peers when we know too few of them, or always
    /// when `force` is set. New peers are gossiped to our connections.
    async fn ensure_known_peers(&self, force: bool) {
        let info_hash = self.info_hash();
        let swarm = &self.registries.swarm;

        if !force && swarm.known_count(info_hash).await >= MIN_KNOWN_PEERS {
            return;
        }

        match self.announce(Event::Started).await {
            Ok(peers) => {
                let new = swarm.register_tracker_peers(info_hash, &peers).await;
                info!("tracker returned {} peers, {new} new", peers.len());
                self.registries
                    .connections
                    .broadcast_new_peers(info_hash, &peers)
                    .await;
            }
            Err(e) => warn!("announce failed: {e}"),
        }
    }

    /// Connect to up to `max` known peers that we are not connected to.
    async fn connect_candidates(&mut self, max: usize) {
        let info_hash = self.info_hash();
        let room = self.max_peers.saturating_sub(self.pool.len());
        let max = max.min(room);
        if max == 0 {
            return;
        }

        let mut candidates = Vec::new();
        for addr in self.registries.swarm.acquire_peers(info_hash, max).await {
            if !self.registries.connections.is_connected(info_hash, &addr).await {
                candidates.push(addr);
            }
        }
        if candidates.is_empty() {
            debug!("no candidates to connect to");
            return;
        }

        let attempts = candidates.iter().map(|addr| self.open(*addr));
        let results = join_all(attempts).await;

        for (addr, r) in candidates.into_iter().zip(results) {
            match r {
                Ok(conn) => self.pool.push(Arc::new(conn)),
                Err(e) => {
                    debug!("could not connect to {addr}: {e}");
                    self.registries
                        .swarm
                        .unregister_active_peer(info_hash, addr)
                        .await;
                }
            }
        }

        info!("{} peers in the pool", self.pool.len());
    }

    async fn open(&self, addr: SocketAddr) -> Result<PeerConnection, Error> {
        let conn = PeerConnection::connect(
            addr,
            self.job.session.clone(),
            self.registries.clone(),
            self.opts.clone(),
        )
        .await?;

        if let Err(e) = conn.await_bootstrap().await {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }
}
