//! Peers and trackers shared by the integration tests.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use peerwire::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    extensions::{Block, Core, CoreCodec, Handshake, HandshakeCodec},
    listener::PeerListener,
    metainfo::Info,
    peer::{handshake, PeerId, PeerOptions},
    registries::Registries,
    torrent::TorrentSession,
    tracker::{event::Event, AnnounceRequest, AnnounceResponse, Announcer},
};
use rand::{distributions::Alphanumeric, Rng};
use tempfile::TempDir;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_util::codec::Framed;

pub const PIECE_LEN: u32 = 16384;

pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .with_file(false)
        .without_time()
        .with_test_writer()
        .try_init();
}

pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// A new empty folder, removed when dropped.
pub fn temp_dir() -> TempDir {
    tempfile::Builder::new().prefix("peerwire-").tempdir().unwrap()
}

/// Random content of `pieces` pieces of [`PIECE_LEN`], the last one is half
/// as long.
pub fn torrent(pieces: usize) -> (Info, Vec<u8>) {
    torrent_with(PIECE_LEN, pieces, PIECE_LEN as usize / 2)
}

pub fn torrent_with(piece_len: u32, pieces: usize, last_len: usize) -> (Info, Vec<u8>) {
    let len = piece_len as usize * (pieces - 1) + last_len;
    let mut rng = rand::thread_rng();
    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    let info = Info::from_data(&random_name(), piece_len, &data).unwrap();
    (info, data)
}

pub fn opts() -> PeerOptions {
    PeerOptions {
        connect_timeout: Duration::from_secs(3),
        piece_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// A session with no pieces, stored on a new temp dir that lives as long as
/// the returned [`TempDir`].
pub fn leecher_session(info: &Info) -> (Arc<TorrentSession>, TempDir) {
    let dir = temp_dir();
    let session = TorrentSession::new(info.clone(), dir.path(), vec![]).unwrap();
    (Arc::new(session), dir)
}

/// A client that listens on loopback, has `data` on disk and serves it.
pub struct Seeder {
    pub addr: SocketAddr,
    pub registries: Arc<Registries>,
    pub session: Arc<TorrentSession>,
    handle: JoinHandle<()>,
    _dir: TempDir,
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn seeder(info: &Info, data: &[u8]) -> Seeder {
    let dir = temp_dir();
    std::fs::write(dir.path().join(&info.name), data).unwrap();

    let session = TorrentSession::new(info.clone(), dir.path(), vec![]).unwrap();
    session.verify_existing().await.unwrap();
    let session = Arc::new(session);

    let registries = Registries::new();
    registries.add_session(session.clone()).await.unwrap();

    let listener = PeerListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        registries.clone(),
        opts(),
    )
    .await
    .unwrap();

    Seeder {
        addr: listener.local_addr(),
        registries,
        session,
        handle: listener.spawn(),
        _dir: dir,
    }
}

/// Returns the same peers on every announce and records the events.
#[derive(Debug, Default)]
pub struct MockAnnouncer {
    peers: Mutex<Vec<SocketAddr>>,
    events: Mutex<Vec<Event>>,
}

impl MockAnnouncer {
    pub fn new(peers: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self { peers: Mutex::new(peers), events: Mutex::new(Vec::new()) })
    }

    pub fn set_peers(&self, peers: Vec<SocketAddr>) {
        *self.peers.lock().unwrap() = peers;
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Announcer for MockAnnouncer {
    fn announce(
        &self,
        req: AnnounceRequest,
    ) -> BoxFuture<'_, Result<AnnounceResponse, Error>> {
        self.events.lock().unwrap().push(req.event);
        let peers = self.peers.lock().unwrap().clone();
        async move { Ok(AnnounceResponse { interval: 1800, peers }) }.boxed()
    }
}

/// How a [`fake_seeder`] answers requests.
#[derive(Debug, Clone)]
pub enum FakeMode {
    Honest,
    /// Every byte of every block is flipped.
    Corrupt,
    /// Only the block of `index` at `begin` is flipped.
    CorruptBlock { index: u32, begin: u32 },
    /// Serve these pieces, close the socket on a request of any other.
    ServeOnly(Vec<usize>),
    /// Unchoke, then never answer a request.
    Stall,
}

/// A seeder without the extension protocol, that behaves as its mode says.
/// It claims to have every piece and counts what it receives.
pub struct FakeSeeder {
    pub addr: SocketAddr,
    pub interested: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl Drop for FakeSeeder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
struct FakePeer {
    pieces: usize,
    piece_len: usize,
    data: Arc<Vec<u8>>,
    mode: FakeMode,
    interested: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

pub async fn fake_seeder(info: &Info, data: &[u8], mode: FakeMode) -> FakeSeeder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = FakePeer {
        pieces: info.pieces(),
        piece_len: info.piece_length as usize,
        data: Arc::new(data.to_vec()),
        mode,
        interested: Arc::default(),
        requests: Arc::default(),
    };
    let (interested, requests) = (peer.interested.clone(), peer.requests.clone());

    let handle = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_fake(socket, peer.clone()));
        }
    });

    FakeSeeder { addr, interested, requests, handle }
}

async fn serve_fake(socket: TcpStream, peer: FakePeer) {
    let mut socket = Framed::new(socket, HandshakeCodec);
    let Ok(theirs) = handshake::read_handshake(&mut socket, Duration::from_secs(5)).await
    else {
        return;
    };

    let mut ours = Handshake::new(theirs.info_hash, [7u8; 20]);
    ours.reserved = [0u8; 8];
    if socket.send(ours).await.is_err() {
        return;
    }
    let mut socket = handshake::into_core(socket);

    let mut bitfield = Bitfield::from_piece(peer.pieces);
    bitfield.fill(true);
    if socket.send(Core::Bitfield(bitfield)).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.next().await {
        let reply = match msg {
            Core::Interested => {
                peer.interested.fetch_add(1, Ordering::SeqCst);
                Core::Unchoke
            }
            Core::Request(req) => {
                peer.requests.fetch_add(1, Ordering::SeqCst);
                let index = req.index as usize;
                match &peer.mode {
                    FakeMode::Stall => continue,
                    FakeMode::ServeOnly(allowed) if !allowed.contains(&index) => return,
                    _ => {}
                }

                let start = index * peer.piece_len + req.begin as usize;
                let mut block = peer.data[start..start + req.len as usize].to_vec();
                let flip = match peer.mode {
                    FakeMode::Corrupt => true,
                    FakeMode::CorruptBlock { index, begin } => {
                        req.index == index && req.begin == begin
                    }
                    _ => false,
                };
                if flip {
                    block.iter_mut().for_each(|b| *b = !*b);
                }
                Core::Piece(Block { index: req.index, begin: req.begin, block })
            }
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            return;
        }
    }
}

/// Handshake with `addr` without running any of the client's logic, the
/// test drives the wire itself.
pub async fn raw_connect(addr: SocketAddr, info: &Info) -> Framed<TcpStream, CoreCodec> {
    let socket = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = handshake::outbound(
        socket,
        info.info_hash,
        PeerId([9u8; 20]),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    socket
}

/// Read messages until `f` matches one, or fail after `wait`.
pub async fn next_matching<F>(
    socket: &mut Framed<TcpStream, CoreCodec>,
    wait: Duration,
    mut f: F,
) -> Option<Core>
where
    F: FnMut(&Core) -> bool,
{
    timeout(wait, async {
        while let Some(Ok(msg)) = socket.next().await {
            if f(&msg) {
                return Some(msg);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Poll `f` until it is true, panics after `wait`.
pub async fn wait_until<F, Fut>(wait: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + wait;
    while !f().await {
        assert!(Instant::now() < deadline, "condition not met in {wait:?}");
        sleep(Duration::from_millis(20)).await;
    }
}
