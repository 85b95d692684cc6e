mod common;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bendy::encoding::ToBencode;
use common::*;
use peerwire::{
    config::{Config, ResolvedConfig},
    daemon::{Daemon, DaemonMsg},
    download::Status,
    error::Error,
    metainfo::MetaInfo,
    tracker::event::Event,
};
use tempfile::TempDir;
use tokio::{task::yield_now, time::timeout};

fn config(dir: &TempDir) -> ResolvedConfig {
    Config {
        download_dir: dir.path().to_path_buf(),
        listen_port: 0,
        reannounce_interval_secs: 1,
        ..Config::default()
    }
    .resolve()
    .unwrap()
}

#[tokio::test]
async fn download_from_magnet() {
    setup();
    let (info, data) = torrent(3);
    let s = seeder(&info, &data).await;

    let dir = temp_dir();
    let config = config(&dir);
    let download_dir = config.download_dir.clone();
    let daemon = Daemon::with_announcer(config, MockAnnouncer::new(vec![s.addr]))
        .await
        .unwrap();
    assert_ne!(daemon.listen_addr().map(|a| a.port()), Some(0));

    let uri = format!(
        "magnet:?xt=urn:btih:{}&dn={}&tr=udp%3A%2F%2Ftracker.example.org%3A1337",
        info.info_hash, info.name
    );
    let id = daemon.ctx.add_magnet(&uri).await.unwrap();

    let status = daemon.ctx.wait_job(id).await.unwrap();
    assert_eq!(status, Status::Completed);
    assert_eq!(std::fs::read(download_dir.join(&info.name)).unwrap(), data);

    let job = daemon.ctx.job(id).await.unwrap();
    assert_eq!(job.session.trackers, vec!["udp://tracker.example.org:1337".to_owned()]);

    let lines = daemon.ctx.status_lines().await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("[Completed] 3/3 pieces"), "{}", lines[0]);

    // the torrent is known now
    let r = daemon.ctx.add_magnet(&uri).await;
    assert!(matches!(r, Err(Error::NoDuplicateTorrent)));
}

#[tokio::test]
async fn torrent_file_retry_and_quit() {
    setup();
    let (info, data) = torrent(2);
    let s = seeder(&info, &data).await;

    let meta = MetaInfo {
        announce: "udp://tracker.example.org:1337/announce".to_owned(),
        info: info.clone(),
        ..Default::default()
    };
    let dir = temp_dir();
    let path = dir.path().join("file.torrent");
    std::fs::write(&path, meta.to_bencode().unwrap()).unwrap();

    let announcer = MockAnnouncer::new(vec![]);
    let mut daemon = Daemon::with_announcer(config(&dir), announcer.clone()).await.unwrap();
    let ctx = daemon.ctx.clone();

    // nobody to download from yet
    let id = ctx.add_torrent(&path).await.unwrap();
    assert_eq!(ctx.wait_job(id).await.unwrap(), Status::TryingToConnect);
    assert!(matches!(ctx.add_torrent(&path).await, Err(Error::NoDuplicateTorrent)));

    announcer.set_peers(vec![s.addr]);
    ctx.retry(id).await.unwrap();
    assert_eq!(ctx.wait_job(id).await.unwrap(), Status::Completed);

    assert!(matches!(ctx.retry(42).await, Err(Error::JobNotFound(42))));
    assert!(matches!(ctx.cancel(42).await, Err(Error::JobNotFound(42))));

    let run = tokio::spawn(async move { daemon.run().await });
    ctx.tx.send(DaemonMsg::PrintStatus).await.unwrap();
    ctx.tx.send(DaemonMsg::Quit).await.unwrap();

    timeout(Duration::from_secs(10), run).await.unwrap().unwrap().unwrap();
    assert!(announcer.events().contains(&Event::Stopped));
    assert!(ctx.registries.sessions().await.is_empty());
}

#[tokio::test]
async fn waiting_job_is_retried_when_peers_appear() {
    setup();
    let (info, data) = torrent(2);
    let s = seeder(&info, &data).await;

    let dir = temp_dir();
    let announcer = MockAnnouncer::new(vec![]);
    let mut daemon = Daemon::with_announcer(config(&dir), announcer.clone()).await.unwrap();
    daemon.quit_after_complete = true;
    let ctx = daemon.ctx.clone();

    let id = ctx.add_info(info.clone(), vec![]).await.unwrap();
    assert_eq!(ctx.wait_job(id).await.unwrap(), Status::TryingToConnect);

    // the daemon learns about the seeder from its next announce
    announcer.set_peers(vec![s.addr]);
    let session = ctx.registries.session(&info.info_hash).await.unwrap();
    ctx.registries
        .swarm
        .register_tracker_peers(info.info_hash, &[s.addr])
        .await;

    timeout(Duration::from_secs(20), daemon.run())
        .await
        .unwrap()
        .unwrap();

    assert!(session.is_complete().await);
}

// The file is already on disk when the job is retried. Other calls on the
// daemon are answered while it is hashed.
#[tokio::test]
async fn retry_verifies_without_blocking_the_jobs() {
    setup();
    let (info, data) = torrent(32);
    let dir = temp_dir();
    let daemon = Daemon::with_announcer(config(&dir), MockAnnouncer::new(vec![]))
        .await
        .unwrap();
    let ctx = daemon.ctx.clone();

    let id = ctx.add_info(info.clone(), vec![]).await.unwrap();
    assert_eq!(ctx.wait_job(id).await.unwrap(), Status::TryingToConnect);
    std::fs::write(dir.path().join(&info.name), &data).unwrap();

    let retried = AtomicBool::new(false);
    let (r, (lines, retried_before)) = tokio::join!(
        async {
            let r = ctx.retry(id).await;
            retried.store(true, Ordering::SeqCst);
            r
        },
        async {
            yield_now().await;
            let lines = ctx.status_lines().await;
            (lines, retried.load(Ordering::SeqCst))
        },
    );
    r.unwrap();
    assert!(!retried_before);
    assert_eq!(lines.len(), 1);

    // retrying a running or completed job does nothing
    ctx.retry(id).await.unwrap();
    assert_eq!(ctx.wait_job(id).await.unwrap(), Status::Completed);
    let lines = ctx.status_lines().await;
    assert!(lines[0].contains("[Completed] 32/32 pieces"), "{}", lines[0]);
}
