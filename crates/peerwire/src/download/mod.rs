//! Download jobs: acquisition of a whole file across a changing pool of
//! peers.
mod worker;

// re-exports
pub use worker::*;

use std::{fmt::Display, net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::sync::{watch, RwLock};

use crate::{torrent::TorrentSession, utils::to_human_readable};

/// Below this many known peers the tracker is asked for more.
pub const MIN_KNOWN_PEERS: usize = 3;

/// Connections opened when a job starts.
pub const INITIAL_PEERS: usize = 3;

/// Discovery runs again after this many pieces.
pub const DISCOVERY_EVERY: usize = 10;

/// Connections opened by a discovery round.
pub const DISCOVERY_BATCH: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Pending,
    Downloading,
    /// No peer could be reached, the job can be retried.
    TryingToConnect,
    Completed,
    Failed(String),
    Cancelled,
}

impl Status {
    /// The worker of the job has exited.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Status::Pending | Status::Downloading)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "Pending"),
            Status::Downloading => write!(f, "Downloading"),
            Status::TryingToConnect => write!(f, "Trying to connect"),
            Status::Completed => write!(f, "Completed"),
            Status::Failed(reason) => write!(f, "Failed: {reason}"),
            Status::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// What a single peer gave to a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub downloaded: u64,
    pub pieces: usize,
}

#[derive(Debug, Default)]
struct JobState {
    status: Status,
    peers: HashMap<SocketAddr, PeerStats>,
    /// piece -> peer it came from
    sources: HashMap<usize, SocketAddr>,
}

/// A file being downloaded. The job is shared between its worker, which
/// drives it, and the daemon, which reports and cancels it.
#[derive(Debug)]
pub struct DownloadJob {
    pub id: u64,
    pub session: Arc<TorrentSession>,
    state: RwLock<JobState>,
    cancel: watch::Sender<bool>,
}

impl DownloadJob {
    pub fn new(id: u64, session: Arc<TorrentSession>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            state: RwLock::new(JobState::default()),
            cancel: watch::channel(false).0,
        })
    }

    pub async fn status(&self) -> Status {
        self.state.read().await.status.clone()
    }

    pub(crate) async fn set_status(&self, status: Status) {
        self.state.write().await.status = status;
    }

    /// Ask the worker to stop, it closes its connections on the way out.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub(crate) fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Clear a previous cancellation so the job can run again.
    pub(crate) async fn reset(&self) {
        self.cancel.send_replace(false);
        self.set_status(Status::Pending).await;
    }

    pub(crate) async fn record_piece(&self, index: usize, peer: SocketAddr, bytes: usize) {
        let mut state = self.state.write().await;
        let stats = state.peers.entry(peer).or_default();
        stats.downloaded += bytes as u64;
        stats.pieces += 1;
        state.sources.insert(index, peer);
    }

    pub async fn peer_stats(&self) -> HashMap<SocketAddr, PeerStats> {
        self.state.read().await.peers.clone()
    }

    /// The peer piece `index` was downloaded from, during this run.
    pub async fn source_of(&self, index: usize) -> Option<SocketAddr> {
        self.state.read().await.sources.get(&index).copied()
    }

    /// One line summary, used by the daemon status output.
    pub async fn status_line(&self) -> String {
        let session = &self.session;
        let status = self.status().await;
        let have = session.have_count().await;
        let total = session.piece_count();
        let done = session.length - session.bytes_left().await;
        let peers = self.state.read().await.peers.len();

        format!(
            "#{} {} [{status}] {have}/{total} pieces, {} of {}, {}/s down {}/s up, \
             {peers} peers contributed",
            self.id,
            session.name,
            to_human_readable(done),
            to_human_readable(session.length),
            to_human_readable(session.counter.download_rate()),
            to_human_readable(session.counter.upload_rate()),
        )
    }
}
