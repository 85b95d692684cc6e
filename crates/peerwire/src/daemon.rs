//! A daemon that runs on the background and owns every torrent and
//! download job of the client.
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    select,
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ResolvedConfig,
    download::{DownloadJob, DownloadTask, Status},
    error::Error,
    listener::PeerListener,
    magnet::Magnet,
    metainfo::{Info, MetaInfo},
    peer::{PeerConnection, PeerOptions},
    registries::Registries,
    torrent::TorrentSession,
    tracker::{event::Event, AnnounceRequest, Announcer, UdpTracker},
};

/// Peers tried when fetching the info dict of a magnet link.
const METADATA_PEERS: usize = 10;

/// Bound of the `Stopped` announce on shutdown.
const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Messages used to control the [`Daemon`].
#[derive(Debug)]
pub enum DaemonMsg {
    /// Path of a `.torrent` file to download.
    AddTorrent(std::path::PathBuf),
    /// Magnet link, its info dict is fetched from peers first.
    AddMagnet(String),
    /// Start a job again, after it failed or was cancelled.
    Retry(u64),
    Cancel(u64),
    /// Print the status of all jobs to stdout.
    PrintStatus,
    /// Gracefully shutdown the Daemon.
    Quit,
}

#[derive(Debug)]
struct JobEntry {
    job: Arc<DownloadJob>,
    handle: Option<JoinHandle<Status>>,
    /// A retry is hashing the file, the job is not running yet.
    retrying: bool,
}

/// Context of the [`Daemon`] that may be shared between other types.
pub struct DaemonCtx {
    pub tx: mpsc::Sender<DaemonMsg>,
    pub config: ResolvedConfig,
    pub registries: Arc<Registries>,
    /// Options of every connection, with the port the listener bound.
    pub opts: PeerOptions,
    /// Used instead of the trackers of each torrent when set.
    announcer: Option<Arc<dyn Announcer>>,
    jobs: RwLock<HashMap<u64, JobEntry>>,
    next_id: AtomicU64,
}

/// The daemon owns the listener, the registries and the download jobs.
/// It is driven by [`DaemonMsg`]s sent on `ctx.tx`.
pub struct Daemon {
    pub ctx: Arc<DaemonCtx>,
    /// Quit when every job is completed.
    pub quit_after_complete: bool,
    rx: mpsc::Receiver<DaemonMsg>,
    listener: Option<PeerListener>,
}

impl Daemon {
    /// Bind the peer listener on `config.listen_port`.
    pub async fn new(config: ResolvedConfig) -> Result<Self, Error> {
        Self::build(config, None).await
    }

    /// Like [`Daemon::new`], but every announce goes to `announcer`.
    pub async fn with_announcer(
        config: ResolvedConfig,
        announcer: Arc<dyn Announcer>,
    ) -> Result<Self, Error> {
        Self::build(config, Some(announcer)).await
    }

    async fn build(
        config: ResolvedConfig,
        announcer: Option<Arc<dyn Announcer>>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<DaemonMsg>(300);
        let registries = Registries::new();

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let listener =
            PeerListener::bind(addr, registries.clone(), config.peer_options()).await?;
        let opts = listener.opts().clone();

        Ok(Self {
            ctx: Arc::new(DaemonCtx {
                tx,
                config,
                registries,
                opts,
                announcer,
                jobs: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            quit_after_complete: false,
            rx,
            listener: Some(listener),
        })
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    /// Run the listener and handle messages until [`DaemonMsg::Quit`].
    /// Seeding torrents are re-announced on every tick, and jobs waiting
    /// for peers are retried when the swarm has candidates.
    pub async fn run(&mut self) -> Result<(), Error> {
        let listener = self.listener.take().map(|l| l.spawn());
        let ctx = self.ctx.clone();

        info!("peerwire daemon is listening on port {}", ctx.opts.listen_port);

        let period = ctx.config.reannounce_interval.max(Duration::from_secs(1));
        let mut tick = interval_at(Instant::now() + period, period);

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    match msg {
                        DaemonMsg::AddTorrent(path) => {
                            if let Err(e) = ctx.add_torrent(&path).await {
                                error!("could not add {}: {e}", path.display());
                            }
                        }
                        DaemonMsg::AddMagnet(uri) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = ctx.add_magnet(&uri).await {
                                    error!("could not add magnet: {e}");
                                }
                            });
                        }
                        DaemonMsg::Retry(id) => {
                            if let Err(e) = ctx.retry(id).await {
                                warn!("{e}");
                            }
                        }
                        DaemonMsg::Cancel(id) => {
                            if let Err(e) = ctx.cancel(id).await {
                                warn!("{e}");
                            }
                        }
                        DaemonMsg::PrintStatus => {
                            for line in ctx.status_lines().await {
                                println!("{line}");
                            }
                        }
                        DaemonMsg::Quit => break,
                    }
                }
                _ = tick.tick() => {
                    ctx.reannounce().await;
                    ctx.retry_waiting().await;

                    if self.quit_after_complete && ctx.all_completed().await {
                        info!("all downloads completed");
                        break;
                    }
                }
            }
        }

        ctx.shutdown().await;
        if let Some(listener) = listener {
            listener.abort();
        }

        Ok(())
    }
}

impl DaemonCtx {
    fn announcer_for(&self, session: &TorrentSession) -> Arc<dyn Announcer> {
        match &self.announcer {
            Some(announcer) => announcer.clone(),
            None => Arc::new(UdpTracker::new(
                session.trackers.clone(),
                self.config.tracker_timeout,
            )),
        }
    }

    async fn announce(
        &self,
        session: &TorrentSession,
        event: Event,
    ) -> Result<Vec<SocketAddr>, Error> {
        let req = AnnounceRequest {
            info_hash: session.info_hash,
            peer_id: self.opts.local_peer_id.clone(),
            port: self.opts.listen_port,
            downloaded: session.counter.downloaded(),
            uploaded: session.counter.uploaded(),
            left: session.bytes_left().await,
            event,
        };
        let res = self.announcer_for(session).announce(req).await?;
        Ok(res.peers)
    }

    /// Add the torrent of a `.torrent` file and start downloading it. Pieces
    /// already on disk are verified and not downloaded again.
    pub async fn add_torrent(&self, path: &Path) -> Result<u64, Error> {
        let buf = tokio::fs::read(path).await?;
        let metainfo = MetaInfo::from_bytes(&buf)?;
        let trackers = metainfo.trackers();
        self.add_info(metainfo.info, trackers).await
    }

    /// Add a torrent of which we know the info dict.
    pub async fn add_info(&self, info: Info, trackers: Vec<String>) -> Result<u64, Error> {
        let session = TorrentSession::new(info, &self.config.download_dir, trackers)?;
        session.verify_existing().await?;

        let session = Arc::new(session);
        self.registries.add_session(session.clone()).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = DownloadJob::new(id, session);
        info!("added job #{id} {}", job.session.name);

        let handle = self.spawn_job(job.clone());
        self.jobs
            .write()
            .await
            .insert(id, JobEntry { job, handle: Some(handle), retrying: false });

        Ok(id)
    }

    /// Fetch the info dict of a magnet link from its peers, then download it
    /// like a `.torrent`.
    pub async fn add_magnet(&self, uri: &str) -> Result<u64, Error> {
        let magnet = Magnet::new(uri)?;
        let info_hash = magnet.parse_xt()?;

        if self.registries.session(&info_hash).await.is_some() {
            return Err(Error::NoDuplicateTorrent);
        }

        let trackers = magnet.parse_trackers();
        let pending = Arc::new(TorrentSession::pending(
            info_hash,
            magnet.parse_dn(),
            &self.config.download_dir,
            trackers.clone(),
        ));

        info!("fetching the metadata of {}", pending.name);
        let info = self.fetch_metadata(pending).await?;
        self.add_info(info, trackers).await
    }

    async fn fetch_metadata(&self, pending: Arc<TorrentSession>) -> Result<Info, Error> {
        let info_hash = pending.info_hash;
        let swarm = &self.registries.swarm;

        match self.announce(&pending, Event::Started).await {
            Ok(peers) => {
                swarm.register_tracker_peers(info_hash, &peers).await;
            }
            Err(e) => warn!("announce failed: {e}"),
        }

        let candidates = swarm.acquire_peers(info_hash, METADATA_PEERS).await;
        if candidates.is_empty() {
            return Err(Error::NoPeers);
        }

        let mut last_err = Error::NoPeers;
        for addr in candidates {
            let conn = match PeerConnection::connect(
                addr,
                pending.clone(),
                self.registries.clone(),
                self.opts.clone(),
            )
            .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("{addr} {e}");
                    swarm.unregister_active_peer(info_hash, addr).await;
                    last_err = e;
                    continue;
                }
            };

            let r = match conn.await_bootstrap().await {
                Ok(()) => conn.request_metadata().await,
                Err(e) => Err(e),
            };
            conn.close().await;

            match r {
                Ok(info) => return Ok(info),
                Err(e) => {
                    warn!("{addr} could not give the metadata: {e}");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    fn spawn_job(&self, job: Arc<DownloadJob>) -> JoinHandle<Status> {
        let announcer = self.announcer_for(&job.session);
        DownloadTask::new(
            job,
            self.registries.clone(),
            announcer,
            self.opts.clone(),
            self.config.max_connections,
        )
        .spawn()
    }

    pub async fn job(&self, id: u64) -> Option<Arc<DownloadJob>> {
        self.jobs.read().await.get(&id).map(|e| e.job.clone())
    }

    /// Wait for the worker of the job to exit.
    pub async fn wait_job(&self, id: u64) -> Result<Status, Error> {
        let handle = {
            let mut jobs = self.jobs.write().await;
            let entry = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
            entry.handle.take()
        };
        let job = self.job(id).await.ok_or(Error::JobNotFound(id))?;

        match handle {
            Some(handle) => match handle.await {
                Ok(status) => Ok(status),
                Err(e) => Ok(Status::Failed(e.to_string())),
            },
            None => Ok(job.status().await),
        }
    }

    /// Start a job again unless it is running or completed.
    pub async fn retry(&self, id: u64) -> Result<(), Error> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let entry = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;

            if entry.retrying || entry.handle.as_ref().is_some_and(|h| !h.is_finished()) {
                debug!("job #{id} is running");
                return Ok(());
            }
            if entry.job.status().await == Status::Completed {
                return Ok(());
            }
            entry.retrying = true;
            entry.job.clone()
        };

        info!("retrying job #{id}");
        job.reset().await;
        // the jobs stay unlocked while the file is hashed
        let verified = job.session.verify_existing().await;

        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        entry.retrying = false;
        verified?;
        entry.handle = Some(self.spawn_job(job));

        Ok(())
    }

    pub async fn cancel(&self, id: u64) -> Result<(), Error> {
        let job = self.job(id).await.ok_or(Error::JobNotFound(id))?;
        info!("cancelling job #{id}");
        job.cancel();
        Ok(())
    }

    pub async fn status_lines(&self) -> Vec<String> {
        let jobs: Vec<Arc<DownloadJob>> =
            self.jobs.read().await.values().map(|e| e.job.clone()).collect();

        let mut lines = Vec::with_capacity(jobs.len());
        for job in jobs {
            job.session.counter.update_rates().await;
            lines.push(job.status_line().await);
        }
        lines.sort();
        lines
    }

    async fn all_completed(&self) -> bool {
        let jobs = self.jobs.read().await;
        for entry in jobs.values() {
            if entry.job.status().await != Status::Completed {
                return false;
            }
        }
        !jobs.is_empty()
    }

    /// Announce the torrents that are complete, so that peers keep finding
    /// us while we seed.
    async fn reannounce(&self) {
        for session in self.registries.sessions().await {
            if !session.is_complete().await {
                continue;
            }
            match self.announce(&session, Event::None).await {
                Ok(peers) => {
                    self.registries
                        .swarm
                        .register_tracker_peers(session.info_hash, &peers)
                        .await;
                }
                Err(e) => debug!("re-announce of {} failed: {e}", session.name),
            }
        }
    }

    /// Restart the jobs that ran out of peers, if there are new candidates.
    async fn retry_waiting(&self) {
        let waiting: Vec<u64> = {
            let jobs = self.jobs.read().await;
            let mut waiting = Vec::new();
            for (id, entry) in jobs.iter() {
                if entry.job.status().await == Status::TryingToConnect {
                    let hash = entry.job.session.info_hash;
                    if !self.registries.swarm.acquire_peers(hash, 1).await.is_empty() {
                        waiting.push(*id);
                    }
                }
            }
            waiting
        };

        for id in waiting {
            if let Err(e) = self.retry(id).await {
                warn!("automatic retry of job #{id} failed: {e}");
            }
        }
    }

    /// Cancel the jobs, tell the trackers we are leaving and close every
    /// connection.
    pub async fn shutdown(&self) {
        info!("shutting down");

        let jobs: Vec<JobEntry> = self.jobs.write().await.drain().map(|(_, e)| e).collect();
        for entry in &jobs {
            entry.job.cancel();
        }
        for entry in jobs {
            if let Some(handle) = entry.handle {
                let _ = handle.await;
            }
        }

        for session in self.registries.sessions().await {
            let r = timeout(STOP_ANNOUNCE_TIMEOUT, self.announce(&session, Event::Stopped));
            if let Ok(Err(e)) = r.await {
                debug!("stopped announce of {} failed: {e}", session.name);
            }
            self.registries.remove_session(&session.info_hash).await;
        }
    }
}
