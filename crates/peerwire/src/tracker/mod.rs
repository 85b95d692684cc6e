//! A tracker is a server that manages peers and stats of multiple torrents.
//!
//! Only UDP trackers are supported, BEP 15
//! <https://www.bittorrent.org/beps/bep_0015.html>
pub mod action;
pub mod announce;
pub mod connect;
pub mod event;

use std::{net::SocketAddr, time::Duration};

use futures::future::BoxFuture;
use tokio::{
    net::UdpSocket,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::Error, metainfo::udp_tracker_host, peer::PeerId, torrent::InfoHash,
    utils::parse_compact_peers,
};

use self::event::Event;

const ANNOUNCE_RES_BUF_LEN: usize = 8192;

/// Announce interval used when the tracker answers with 0.
const DEFAULT_INTERVAL: u32 = 1800;

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds until the next regular announce.
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
}

/// Something that hands out the peers of a torrent.
pub trait Announcer: Send + Sync {
    /// An announce is the communication of the local peer to the tracker, for
    /// example:
    /// - When the torrent starts, we announce with [`Event::Started`] to get
    ///   the list of peers for this torrent.
    /// - When the download completes, with [`Event::Completed`].
    /// - Periodically while seeding, with [`Event::None`].
    fn announce(
        &self,
        req: AnnounceRequest,
    ) -> BoxFuture<'_, Result<AnnounceResponse, Error>>;
}

/// Announces to a list of `udp://` trackers, in order, and returns the
/// answer of the first one that responds.
#[derive(Debug, Clone)]
pub struct UdpTracker {
    trackers: Vec<String>,
    /// Bound of the whole exchange with one tracker.
    timeout: Duration,
    /// First retransmission timeout, doubled on every retry.
    retransmit: Duration,
}

impl UdpTracker {
    pub fn new(trackers: Vec<String>, timeout: Duration) -> Self {
        Self { trackers, timeout, retransmit: Duration::from_secs(15) }
    }

    pub fn with_retransmit(mut self, retransmit: Duration) -> Self {
        self.retransmit = retransmit;
        self
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    /// Bind an UDP socket connected to `host`.
    async fn new_udp_socket(host: &str) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|_| Error::TrackerSocketAddr)?;
        socket.connect(host).await.map_err(|_| Error::TrackerSocketConnect)?;
        Ok(socket)
    }

    /// Send `payload` and wait for an answer, retransmitting with the BEP 15
    /// back-off of `retransmit * 2^n`.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        payload: &[u8],
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<usize, Error> {
        let mut wait = self.retransmit;

        loop {
            socket.send(payload).await?;

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::Timeout);
            }

            match timeout(wait.min(left), socket.recv(buf)).await {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => {
                    warn!("error receiving from tracker: {e}");
                    return Err(Error::TrackerResponse);
                }
                Err(_) => {
                    wait *= 2;
                    debug!("tracker request was lost, trying again in {wait:?}");
                }
            }
        }
    }

    async fn connect(
        &self,
        socket: &UdpSocket,
        deadline: Instant,
    ) -> Result<u64, Error> {
        let req = connect::Request::new();
        let mut buf = [0u8; connect::Response::LENGTH];

        let len = self.exchange(socket, &req.serialize()?, &mut buf, deadline).await?;
        let res = connect::Response::deserialize(&buf[..len])?;

        if !res.answers(&req) {
            warn!("connect response is not valid {res:?}");
            return Err(Error::TrackerResponse);
        }

        Ok(res.connection_id)
    }

    #[tracing::instrument(name = "tracker", skip_all, fields(host = %host))]
    async fn announce_to(
        &self,
        host: &str,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, Error> {
        let deadline = Instant::now() + self.timeout;
        let socket = Self::new_udp_socket(host).await?;
        let tracker_addr = socket.peer_addr()?;

        let connection_id = self.connect(&socket, deadline).await?;
        debug!("connected, announcing {:?}", req.event);

        let announce = announce::Request {
            connection_id,
            info_hash: req.info_hash,
            peer_id: req.peer_id.clone(),
            downloaded: req.downloaded,
            left: req.left,
            uploaded: req.uploaded,
            event: req.event,
            port: req.port,
            ..Default::default()
        };

        let mut buf = [0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self
            .exchange(&socket, &announce.serialize()?, &mut buf, deadline)
            .await?;

        let (res, payload) = announce::Response::deserialize(&buf[..len])?;
        if !res.answers(&announce) {
            return Err(Error::TrackerResponse);
        }

        let stride = if tracker_addr.is_ipv6() { 18 } else { 6 };
        let peers = parse_compact_peers(payload, stride);

        info!(
            "tracker answered with {} peers, {} seeders {} leechers",
            peers.len(),
            res.seeders,
            res.leechers
        );

        let interval = if res.interval == 0 { DEFAULT_INTERVAL } else { res.interval };
        Ok(AnnounceResponse { interval, peers })
    }
}

impl Announcer for UdpTracker {
    fn announce(
        &self,
        req: AnnounceRequest,
    ) -> BoxFuture<'_, Result<AnnounceResponse, Error>> {
        Box::pin(async move {
            let mut last_err = Error::TrackerNoHosts;

            for tracker in &self.trackers {
                let Some(host) = udp_tracker_host(tracker) else {
                    debug!("skipping tracker {tracker}");
                    last_err = Error::TrackerUnsupported(tracker.clone());
                    continue;
                };

                match self.announce_to(&host, &req).await {
                    Ok(res) => return Ok(res),
                    Err(e) => {
                        debug!("tracker {host} failed: {e}");
                        last_err = e;
                    }
                }
            }

            warn!("no tracker answered the announce of {:?}", req.info_hash);
            Err(last_err)
        })
    }
}
