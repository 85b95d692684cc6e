//! A remote peer in the network that downloads and uploads data.
//!
//! Each connection runs two tasks: the reader task, which is the only one
//! reading the socket, and the writer task, which owns the write half so
//! that frames never interleave. The reader hands received blocks and
//! control messages to the caller through two channels.

pub mod handshake;
mod queue;
mod types;
mod upload;

// re-exports
pub use queue::*;
pub use types::*;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    select, spawn,
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt, Reserved},
    error::Error,
    extensions::{
        metadata_pieces, Block, BlockInfo, Core, CoreCodec, ExtendedMessage,
        ExtendedMsg, ExtensionKind, ExtensionRegistry, Handshake,
        HandshakeCodec, MetadataMsg, Pex, BLOCK_LEN, M, METADATA_PIECE_LEN,
        PEX_MAX_PEERS, UT_METADATA,
    },
    metainfo::Info,
    registries::Registries,
    torrent::{InfoHash, TorrentSession},
};

/// How long the extension handshake may take.
const EXTENSION_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer without pieces may never send a Bitfield.
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay of the first PEX message of an outbound connection.
const PEX_SETTLE_OUTBOUND: Duration = Duration::from_secs(1);

/// Delay of the first PEX message of an inbound connection.
const PEX_SETTLE_INBOUND: Duration = Duration::from_secs(2);

const PEX_FIRST_TICK: Duration = Duration::from_secs(10);
const PEX_INTERVAL: Duration = Duration::from_secs(15);

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Keep-alives are echoed at most once in this window, otherwise two
/// clients that echo would bounce them forever.
const KEEP_ALIVE_ECHO_WINDOW: Duration = Duration::from_secs(30);

/// Largest info dict we accept over ut_metadata.
const MAX_METADATA_SIZE: u32 = 16 * 1024 * 1024;

/// Settings of the local client that every connection needs.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub local_peer_id: PeerId,
    pub listen_port: u16,
    /// Ids this side advertises on the extension handshake.
    pub extensions: M,
    pub connect_timeout: Duration,
    /// Bound of every wait of a piece download, unchoke and each block.
    pub piece_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            local_peer_id: PeerId::generate("-PW0001-"),
            listen_port: 6881,
            extensions: M { ut_metadata: Some(3), ut_pex: Some(4) },
            connect_timeout: Duration::from_secs(10),
            piece_timeout: Duration::from_secs(30),
        }
    }
}

/// State of a connection shared between its tasks, the caller, and the
/// [`ConnectionRegistry`](crate::connections::ConnectionRegistry).
#[derive(Debug)]
pub struct PeerCtx {
    /// Peer id of the remote peer.
    pub id: PeerId,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub direction: Direction,
    /// Reserved bytes of the remote handshake.
    pub reserved: Reserved,
    pub session: Arc<TorrentSession>,
    pub registries: Arc<Registries>,
    pub opts: PeerOptions,
    pub extensions: RwLock<ExtensionRegistry>,
    /// Pieces of the remote peer.
    pub remote_bitfield: RwLock<Bitfield>,
    pub am_choking: AtomicBool,
    pub am_interested: AtomicBool,
    pub peer_interested: AtomicBool,
    peer_choking: watch::Sender<bool>,
    closed: AtomicBool,
    state: AtomicU8,
    /// Address the remote peer accepts connections on.
    listen_addr: RwLock<Option<SocketAddr>>,
    last_keep_alive_echo: Mutex<Option<Instant>>,
    /// Piece of the download in flight, blocks of any other are dropped.
    wanted_piece: watch::Sender<Option<u32>>,
    wants_metadata: AtomicBool,
    /// The first Bitfield and extension handshake are handed over while
    /// [`PeerConnection::await_bootstrap`] may still wait for them.
    bootstrapping: AtomicBool,
    bitfield_seen: AtomicBool,
    extension_seen: AtomicBool,
    tx: mpsc::UnboundedSender<Core>,
    shutdown: watch::Sender<bool>,
}

/// Runs its closure when dropped, also when the future holding it is
/// cancelled.
struct OnDrop<F: FnMut()>(F);

impl<F: FnMut()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        (self.0)()
    }
}

/// Senders of the reader task.
struct Handoff {
    blocks: mpsc::UnboundedSender<Block>,
    control: mpsc::UnboundedSender<Control>,
}

impl PeerCtx {
    pub fn info_hash(&self) -> InfoHash {
        self.session.info_hash
    }

    /// Queue a message for the writer task.
    pub fn send(&self, msg: Core) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::PeerClosedSocket);
        }
        self.tx.send(msg)?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, state: ConnectionState) {
        if !self.is_closed() {
            self.state.store(state as u8, Ordering::Release);
        }
    }

    pub fn peer_choking(&self) -> bool {
        *self.peer_choking.borrow()
    }

    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.read().await
    }

    /// Both sides negotiated `kind`.
    pub async fn supports(&self, kind: ExtensionKind) -> bool {
        self.extensions.read().await.supports(kind)
    }

    /// Sends `Interested` only the first time.
    pub fn send_interested(&self) -> Result<(), Error> {
        if self.am_interested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("{} > interested", self.remote_addr);
        self.send(Core::Interested)
    }

    fn unchoke(&self) -> Result<(), Error> {
        if !self.am_choking.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("{} > unchoke", self.remote_addr);
        self.send(Core::Unchoke)
    }

    pub async fn send_extension_handshake(&self) -> Result<(), Error> {
        let ext = self
            .extensions
            .read()
            .await
            .local_handshake(self.opts.listen_port, self.session.metadata_size());
        debug!("{} > extension handshake", self.remote_addr);
        self.send(ExtendedMessage::try_from(ext)?.into())
    }

    /// Our bitfield is only sent when we have at least one piece.
    pub async fn send_bitfield(&self) -> Result<(), Error> {
        if self.session.have_count().await == 0 {
            return Ok(());
        }
        debug!("{} > bitfield", self.remote_addr);
        self.send(Core::Bitfield(self.session.bitfield().await))
    }

    pub async fn send_pex(&self, pex: &Pex) -> Result<(), Error> {
        let msg = self.extensions.read().await.encode_pex(pex)?;
        debug!(
            "{} > pex added={} dropped={}",
            self.remote_addr,
            pex.added.len(),
            pex.dropped.len()
        );
        self.send(msg.into())
    }

    /// Gossip the peers of the swarm that this peer hasn't heard of from us
    /// recently, and the peers that went away. Nothing is sent when there is
    /// no news.
    pub async fn send_pex_update(&self) -> Result<(), Error> {
        if !self.supports(ExtensionKind::Pex).await {
            return Ok(());
        }
        let info_hash = self.info_hash();
        let swarm = &self.registries.swarm;

        let mut exclude = vec![
            self.remote_addr,
            SocketAddr::new(self.local_addr.ip(), self.opts.listen_port),
        ];
        if let Some(addr) = self.listen_addr().await {
            exclude.push(addr);
        }

        let added = swarm
            .peers_for_pex(info_hash, self.remote_addr, &exclude, PEX_MAX_PEERS)
            .await;
        let dropped = swarm.dropped_peers(info_hash, PEX_MAX_PEERS).await;

        let pex = Pex { added, dropped };
        if pex.is_empty() {
            return Ok(());
        }
        self.send_pex(&pex).await
    }

    /// Mark the connection as closed, stop its tasks and remove it from the
    /// registries. Calling it again does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.shutdown.send_replace(true);

        info!("{} connection closed", self.remote_addr);

        let info_hash = self.info_hash();
        self.registries.connections.unregister(info_hash, self.remote_addr).await;
        if let Some(addr) = self.listen_addr().await {
            self.registries.swarm.unregister_active_peer(info_hash, addr).await;
        }
    }

    /// Resolves when the connection is closed.
    async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    /// Handle a message received by the reader task.
    async fn handle_incoming(&self, msg: Core, handoff: &Handoff) -> Result<(), Error> {
        let remote = self.remote_addr;

        match msg {
            Core::KeepAlive => {
                let mut last = self.last_keep_alive_echo.lock().await;
                let now = Instant::now();
                if last.map_or(true, |at| now.duration_since(at) >= KEEP_ALIVE_ECHO_WINDOW) {
                    *last = Some(now);
                    self.send(Core::KeepAlive)?;
                }
            }
            Core::Choke => {
                self.peer_choking.send_replace(true);
            }
            Core::Unchoke => {
                self.peer_choking.send_replace(false);
            }
            Core::Interested => {
                self.peer_interested.store(true, Ordering::Release);
                self.unchoke()?;
            }
            Core::NotInterested => {
                self.peer_interested.store(false, Ordering::Release);
            }
            Core::Have(piece) => {
                let piece = piece as usize;
                if piece >= self.session.piece_count() {
                    warn!("{remote} sent have {piece} past the last piece");
                    return Ok(());
                }
                self.remote_bitfield.write().await.safe_set(piece);
            }
            Core::Bitfield(mut bitfield) => {
                bitfield.resize(self.session.piece_count(), false);
                *self.remote_bitfield.write().await = bitfield.clone();
                if self.hand_over_once(&self.bitfield_seen) {
                    let _ = handoff.control.send(Control::Bitfield(bitfield));
                }
            }
            Core::Request(info) => {
                self.serve_request(info).await?;
            }
            Core::Piece(block) => {
                if *self.wanted_piece.borrow() == Some(block.index) {
                    let _ = handoff.blocks.send(block);
                } else {
                    debug!("{remote} sent unrequested block of piece {}", block.index);
                }
            }
            Core::Cancel(info) => {
                debug!("{remote} cancelled {info:?}");
            }
            Core::Extended(msg) => {
                let msg = self.extensions.read().await.decode(msg)?;
                self.handle_extended(msg, handoff).await?;
            }
        }

        Ok(())
    }

    async fn handle_extended(&self, msg: ExtendedMsg, handoff: &Handoff) -> Result<(), Error> {
        let remote = self.remote_addr;
        let info_hash = self.info_hash();

        match msg {
            ExtendedMsg::Handshake(ext) => {
                debug!("{remote} < extension handshake {:?}", ext.v);
                self.extensions.write().await.record_handshake(&ext);

                if self.direction == Direction::Inbound {
                    if let Some(port) = ext.p.filter(|p| *p > 0) {
                        let addr = SocketAddr::new(remote.ip(), port);
                        *self.listen_addr.write().await = Some(addr);
                        self.registries.swarm.register_active_peer(info_hash, addr).await;
                    }
                }
                if self.hand_over_once(&self.extension_seen) {
                    let _ = handoff.control.send(Control::Extension(ext));
                }
            }
            ExtendedMsg::Metadata(MetadataMsg::Request(piece)) => {
                let answer = MetadataMsg::data(piece, self.session.info_bytes())
                    .unwrap_or(MetadataMsg::Reject(piece));
                debug!("{remote} > metadata {:?} {piece}", answer.msg_type());
                let msg = self.extensions.read().await.encode_metadata(&answer)?;
                self.send(msg.into())?;
            }
            ExtendedMsg::Metadata(msg) => {
                if self.wants_metadata.load(Ordering::Acquire) {
                    let _ = handoff.control.send(Control::Metadata(msg));
                } else {
                    debug!("{remote} sent unrequested metadata {:?}", msg.msg_type());
                }
            }
            ExtendedMsg::Pex(pex) => {
                debug!(
                    "{remote} < pex added={} dropped={}",
                    pex.added.len(),
                    pex.dropped.len()
                );
                let new = self
                    .registries
                    .swarm
                    .on_pex_peers_discovered(info_hash, &pex.added)
                    .await;
                if !new.is_empty() {
                    self.registries
                        .connections
                        .broadcast_new_peers(info_hash, &new)
                        .await;
                }
                for addr in pex.dropped {
                    if !self.registries.connections.is_connected(info_hash, &addr).await {
                        self.registries.swarm.unregister_active_peer(info_hash, addr).await;
                    }
                }
            }
            ExtendedMsg::Unknown(id, _) => {
                debug!("{remote} sent unknown extended message {id}");
            }
        }

        Ok(())
    }

    /// Bootstrap messages are handed over only during the bootstrap, and
    /// only the first of each kind.
    fn hand_over_once(&self, seen: &AtomicBool) -> bool {
        self.bootstrapping.load(Ordering::Acquire) && !seen.swap(true, Ordering::AcqRel)
    }
}

/// An established connection, used by whoever drives the downloads.
#[derive(Debug)]
pub struct PeerConnection {
    pub ctx: Arc<PeerCtx>,
    control: Mutex<ControlQueue>,
    blocks: Mutex<mpsc::UnboundedReceiver<Block>>,
    bootstrapped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Open a connection to `addr` and handshake for `session`.
    #[tracing::instrument(skip_all, fields(addr = %addr))]
    pub async fn connect(
        addr: SocketAddr,
        session: Arc<TorrentSession>,
        registries: Arc<Registries>,
        opts: PeerOptions,
    ) -> Result<Self, Error> {
        debug!("connecting");

        let socket = match timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
            Ok(socket) => socket?,
            Err(_) => return Err(Error::ConnectTimeout(addr)),
        };

        let (socket, theirs) = handshake::outbound(
            socket,
            session.info_hash,
            opts.local_peer_id.clone(),
            opts.connect_timeout,
        )
        .await?;

        let conn =
            Self::start(socket, theirs, Direction::Outbound, session, registries, opts)
                .await?;

        *conn.ctx.listen_addr.write().await = Some(addr);
        conn.ctx
            .registries
            .swarm
            .register_active_peer(conn.ctx.info_hash(), addr)
            .await;

        info!("connected to {addr}");
        Ok(conn)
    }

    /// Serve a connection that a peer opened to us, the torrent is looked up
    /// by the info hash of its handshake.
    pub async fn accept(
        socket: TcpStream,
        registries: Arc<Registries>,
        opts: PeerOptions,
    ) -> Result<Self, Error> {
        let remote = socket.peer_addr()?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let theirs = handshake::read_handshake(&mut socket, opts.connect_timeout).await?;
        debug!("{remote} < handshake");

        let session = registries
            .session(&theirs.info_hash)
            .await
            .ok_or(Error::TorrentDoesNotExist(theirs.info_hash))?;

        let socket =
            handshake::reply_inbound(socket, &theirs, opts.local_peer_id.clone()).await?;

        let conn =
            Self::start(socket, theirs, Direction::Inbound, session, registries, opts)
                .await?;
        let ctx = &conn.ctx;

        if ctx.reserved.supports_extended() {
            ctx.set_state(ConnectionState::NegotiatingExtensions);
            ctx.send_extension_handshake().await?;
        }
        ctx.send_bitfield().await?;
        ctx.set_state(ConnectionState::Ready);

        if ctx.reserved.supports_extended() {
            conn.spawn_pex_loop(PEX_SETTLE_INBOUND).await;
        }

        info!("accepted {remote}");
        Ok(conn)
    }

    /// Spawn the reader and writer tasks and register the connection.
    async fn start(
        socket: Framed<TcpStream, CoreCodec>,
        theirs: Handshake,
        direction: Direction,
        session: Arc<TorrentSession>,
        registries: Arc<Registries>,
        opts: PeerOptions,
    ) -> Result<Self, Error> {
        let remote_addr = socket.get_ref().peer_addr()?;
        let local_addr = socket.get_ref().local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (blocks_tx, blocks_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(PeerCtx {
            id: theirs.peer_id.clone(),
            remote_addr,
            local_addr,
            direction,
            reserved: theirs.reserved(),
            remote_bitfield: RwLock::new(Bitfield::from_piece(session.piece_count())),
            extensions: RwLock::new(ExtensionRegistry::new(opts.extensions)),
            session,
            registries,
            opts,
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_interested: AtomicBool::new(false),
            peer_choking: watch::channel(true).0,
            closed: AtomicBool::new(false),
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            listen_addr: RwLock::new(None),
            last_keep_alive_echo: Mutex::new(None),
            wanted_piece: watch::channel(None).0,
            wants_metadata: AtomicBool::new(false),
            bootstrapping: AtomicBool::new(direction == Direction::Outbound),
            bitfield_seen: AtomicBool::new(false),
            extension_seen: AtomicBool::new(false),
            tx,
            shutdown: watch::channel(false).0,
        });

        let (sink, stream) = socket.split();
        let handoff = Handoff { blocks: blocks_tx, control: control_tx };

        let reader = spawn(read_loop(ctx.clone(), stream, handoff));
        let writer = spawn(write_loop(ctx.clone(), sink, rx));

        ctx.registries.connections.register(ctx.clone()).await;

        Ok(Self {
            ctx,
            control: Mutex::new(ControlQueue::new(control_rx)),
            blocks: Mutex::new(blocks_rx),
            bootstrapped: AtomicBool::new(false),
            tasks: Mutex::new(vec![reader, writer]),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.ctx.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// Resolves when the connection is closed, by either side.
    pub async fn closed(&self) {
        self.ctx.closed().await
    }

    /// Negotiate extensions and learn which pieces the peer has. After this
    /// the connection is ready for piece requests.
    pub async fn await_bootstrap(&self) -> Result<(), Error> {
        if self.bootstrapped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ctx = &self.ctx;
        let remote = ctx.remote_addr;
        let mut control = self.control.lock().await;

        let bootstrap = self.wait_bootstrap(&mut control).await;
        ctx.bootstrapping.store(false, Ordering::Release);
        control.clear();
        drop(control);
        bootstrap?;

        ctx.send_bitfield().await?;
        ctx.set_state(ConnectionState::Ready);

        if ctx.supports(ExtensionKind::Pex).await {
            self.spawn_pex_loop(PEX_SETTLE_OUTBOUND).await;
        }

        debug!("{remote} bootstrap done");
        Ok(())
    }

    async fn wait_bootstrap(&self, control: &mut ControlQueue) -> Result<(), Error> {
        let ctx = &self.ctx;

        if ctx.reserved.supports_extended() {
            ctx.set_state(ConnectionState::NegotiatingExtensions);
            ctx.send_extension_handshake().await?;

            timeout(
                EXTENSION_TIMEOUT,
                control.wait_for(|m| matches!(m, Control::Extension(_))),
            )
            .await
            .map_err(|_| Error::Timeout)??;
        }

        ctx.set_state(ConnectionState::AwaitingBitfield);
        match timeout(
            BITFIELD_TIMEOUT,
            control.wait_for(|m| matches!(m, Control::Bitfield(_))),
        )
        .await
        {
            Ok(r) => {
                r?;
            }
            Err(_) => debug!("{} sent no bitfield", ctx.remote_addr),
        }
        Ok(())
    }

    /// One PEX update after `settle`, then periodic ones while the
    /// connection lives.
    async fn spawn_pex_loop(&self, settle: Duration) {
        let ctx = self.ctx.clone();

        let handle = spawn(async move {
            let run = async {
                sleep(settle).await;
                if let Err(e) = ctx.send_pex_update().await {
                    debug!("{} initial pex failed: {e}", ctx.remote_addr);
                }

                let mut tick = interval_at(Instant::now() + PEX_FIRST_TICK, PEX_INTERVAL);
                loop {
                    tick.tick().await;
                    if let Err(e) = ctx.send_pex_update().await {
                        debug!("{} pex failed: {e}", ctx.remote_addr);
                        break;
                    }
                }
            };

            select! {
                _ = run => {}
                _ = ctx.closed() => {}
            }
        });

        self.tasks.lock().await.push(handle);
    }

    pub fn send_interested(&self) -> Result<(), Error> {
        self.ctx.send_interested()
    }

    pub async fn send_pex_update(&self) -> Result<(), Error> {
        self.ctx.send_pex_update().await
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        self.ctx.remote_bitfield.read().await.has(index)
    }

    async fn wait_unchoke(&self) -> Result<(), Error> {
        let ctx = &self.ctx;
        let mut choking = ctx.peer_choking.subscribe();

        let unchoked = async {
            loop {
                if !*choking.borrow_and_update() {
                    return Ok(());
                }
                choking.changed().await.map_err(|_| Error::PeerClosedSocket)?;
            }
        };

        let wait = async {
            select! {
                r = unchoked => r,
                _ = ctx.closed() => Err(Error::PeerClosedSocket),
            }
        };

        timeout(ctx.opts.piece_timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Download, verify and store one piece from this peer. On success the
    /// piece is on disk, its bit is set, and every connection of the torrent
    /// was told about it.
    #[tracing::instrument(skip(self), fields(remote = %self.ctx.remote_addr))]
    pub async fn download_piece(&self, index: usize) -> Result<Vec<u8>, Error> {
        let ctx = &self.ctx;
        let session = &ctx.session;

        if ctx.is_closed() {
            return Err(Error::PeerClosedSocket);
        }
        if index >= session.piece_count() {
            return Err(Error::PieceOutOfBounds(index));
        }

        let piece_len = session.piece_len(index);
        ctx.send_interested()?;
        self.wait_unchoke().await?;

        let mut blocks = self.blocks.lock().await;
        // left over by a download that was cancelled
        while blocks.try_recv().is_ok() {}
        ctx.wanted_piece.send_replace(Some(index as u32));
        let wanted = OnDrop(|| {
            ctx.wanted_piece.send_replace(None);
        });

        let infos = BlockInfo::split_piece(index as u32, piece_len);
        for info in &infos {
            ctx.send(Core::Request(info.clone()))?;
        }

        let received = Self::receive_blocks(ctx, &mut blocks, index, piece_len, &infos).await;
        drop(wanted);
        // blocks that arrived after the last one was read
        while blocks.try_recv().is_ok() {}
        drop(blocks);
        let buf = received?;

        if !session.verify(index, &buf) {
            warn!("piece {index} failed the hash check");
            return Err(Error::PieceInvalid(index));
        }

        session.write_piece(index, &buf).await?;
        session.counter.record_download(buf.len() as u64);

        ctx.send(Core::Have(index as u32))?;
        ctx.registries
            .connections
            .broadcast_have(ctx.info_hash(), index as u32, Some(ctx.remote_addr))
            .await;

        debug!("downloaded piece {index}");
        Ok(buf)
    }

    async fn receive_blocks(
        ctx: &PeerCtx,
        blocks: &mut mpsc::UnboundedReceiver<Block>,
        index: usize,
        piece_len: u32,
        infos: &[BlockInfo],
    ) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; piece_len as usize];
        let mut received = vec![false; infos.len()];
        let mut missing = infos.len();

        while missing > 0 {
            let block = match timeout(ctx.opts.piece_timeout, blocks.recv()).await {
                Ok(Some(block)) => block,
                Ok(None) => return Err(Error::PeerClosedSocket),
                Err(_) => return Err(Error::Timeout),
            };

            if block.index as usize != index {
                debug!("discarding block of piece {}", block.index);
                continue;
            }

            let slot = (block.begin / BLOCK_LEN) as usize;
            let Some(info) = infos.get(slot).filter(|i| i.begin == block.begin) else {
                warn!("block with unexpected begin {}", block.begin);
                continue;
            };
            if block.block.len() != info.len as usize {
                warn!("block of {} bytes, expected {}", block.block.len(), info.len);
                continue;
            }
            if received[slot] {
                continue;
            }

            let begin = block.begin as usize;
            buf[begin..begin + block.block.len()].copy_from_slice(&block.block);
            received[slot] = true;
            missing -= 1;
        }

        Ok(buf)
    }

    /// Download the info dictionary over ut_metadata and check it against
    /// the info hash.
    pub async fn request_metadata(&self) -> Result<Info, Error> {
        let ctx = &self.ctx;
        let remote = ctx.remote_addr;

        let size = {
            let ext = ctx.extensions.read().await;
            if !ext.supports(ExtensionKind::Metadata) {
                return Err(Error::ExtensionNotSupported(UT_METADATA));
            }
            ext.remote()
                .and_then(|r| r.metadata_size)
                .filter(|s| *s > 0 && *s <= MAX_METADATA_SIZE)
                .ok_or(Error::MetadataInvalid)?
        };

        let pieces = metadata_pieces(size as usize);
        info!("{remote} requesting {pieces} metadata pieces");

        let mut control = self.control.lock().await;
        ctx.wants_metadata.store(true, Ordering::Release);
        let wanted = OnDrop(|| ctx.wants_metadata.store(false, Ordering::Release));

        let info = Self::receive_metadata(ctx, &mut control, size, pieces).await;
        drop(wanted);
        control.clear();
        drop(control);
        let info = info?;

        if Info::info_hash(&info) != ctx.info_hash() {
            warn!("{remote} sent metadata that doesn't match the info hash");
            return Err(Error::MetadataInvalid);
        }

        Info::from_bytes(&info)
    }

    async fn receive_metadata(
        ctx: &PeerCtx,
        control: &mut ControlQueue,
        size: u32,
        pieces: u32,
    ) -> Result<Vec<u8>, Error> {
        for piece in 0..pieces {
            let msg = ctx
                .extensions
                .read()
                .await
                .encode_metadata(&MetadataMsg::Request(piece))?;
            ctx.send(msg.into())?;
        }

        let mut info = vec![0u8; size as usize];
        let mut received = vec![false; pieces as usize];
        let mut missing = pieces;

        while missing > 0 {
            let msg = timeout(
                ctx.opts.piece_timeout,
                control.wait_for(|m| matches!(m, Control::Metadata(_))),
            )
            .await
            .map_err(|_| Error::Timeout)??;

            match msg {
                Control::Metadata(MetadataMsg::Data { piece, total_size, payload }) => {
                    if total_size != size || piece >= pieces {
                        return Err(Error::MetadataInvalid);
                    }
                    let start = piece as usize * METADATA_PIECE_LEN;
                    let end = (start + METADATA_PIECE_LEN).min(size as usize);
                    if payload.len() != end - start {
                        return Err(Error::MetadataInvalid);
                    }
                    if !received[piece as usize] {
                        info[start..end].copy_from_slice(&payload);
                        received[piece as usize] = true;
                        missing -= 1;
                    }
                }
                Control::Metadata(MetadataMsg::Reject(piece)) => {
                    return Err(Error::MetadataRejected(piece));
                }
                _ => {}
            }
        }

        Ok(info)
    }

    /// Close the connection, calling it again does nothing.
    pub async fn close(&self) {
        self.ctx.close().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn read_loop(
    ctx: Arc<PeerCtx>,
    mut stream: SplitStream<Framed<TcpStream, CoreCodec>>,
    handoff: Handoff,
) {
    let remote = ctx.remote_addr;
    let mut shutdown = ctx.shutdown.subscribe();

    loop {
        select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        debug!("{remote} < {}", msg.name());
                        if let Err(e) = ctx.handle_incoming(msg, &handoff).await {
                            warn!("{remote} {e}");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("{remote} protocol error: {e}");
                        break;
                    }
                    None => {
                        debug!("{remote} closed the socket");
                        break;
                    }
                }
            }
            _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
        }
    }

    ctx.close().await;
}

async fn write_loop(
    ctx: Arc<PeerCtx>,
    mut sink: SplitSink<Framed<TcpStream, CoreCodec>, Core>,
    mut rx: mpsc::UnboundedReceiver<Core>,
) {
    let remote = ctx.remote_addr;
    let mut shutdown = ctx.shutdown.subscribe();
    let mut keep_alive =
        interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);

    loop {
        select! {
            Some(msg) = rx.recv() => {
                debug!("{remote} > {}", msg.name());
                if let Err(e) = sink.send(msg).await {
                    debug!("{remote} write failed: {e}");
                    break;
                }
            }
            _ = keep_alive.tick() => {
                if sink.send(Core::KeepAlive).await.is_err() {
                    break;
                }
            }
            _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
        }
    }

    let _ = sink.close().await;
    ctx.close().await;
}
