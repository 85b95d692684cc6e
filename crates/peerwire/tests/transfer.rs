mod common;

use std::{sync::atomic::Ordering, time::Duration};

use common::*;
use futures::SinkExt;
use peerwire::{
    download::{DownloadJob, DownloadTask, Status},
    error::Error,
    extensions::{BlockInfo, Core},
    listener::PeerListener,
    peer::{PeerConnection, PeerOptions},
    registries::Registries,
    tracker::event::Event,
};
use tokio::time::{timeout, Instant};

// Two seeders with the whole file, 4 pieces of 16 KiB with a last one of
// 8 KiB. Pieces alternate between them, and a third peer connected to the
// leecher is told about every piece.
#[tokio::test]
async fn round_robin_between_two_seeders() {
    setup();
    let (info, data) = torrent(4);
    let a = seeder(&info, &data).await;
    let b = seeder(&info, &data).await;

    let registries = Registries::new();
    let (session, _dir) = leecher_session(&info);
    registries.add_session(session.clone()).await.unwrap();

    let listener =
        PeerListener::bind("127.0.0.1:0".parse().unwrap(), registries.clone(), opts())
            .await
            .unwrap();
    let listen_addr = listener.local_addr();
    let opts = listener.opts().clone();
    let _listener = listener.spawn();

    let mut passive = raw_connect(listen_addr, &info).await;
    let conns = &registries.connections;
    let hash = info.info_hash;
    wait_until(Duration::from_secs(5), || async move { conns.count(hash).await == 1 }).await;

    let announcer = MockAnnouncer::new(vec![a.addr, b.addr]);
    let job = DownloadJob::new(1, session.clone());
    let handle =
        DownloadTask::new(job.clone(), registries.clone(), announcer.clone(), opts, 50)
            .spawn();

    let mut haves = Vec::new();
    while haves.len() < 4 {
        let msg = next_matching(&mut passive, Duration::from_secs(20), |m| {
            matches!(m, Core::Have(_))
        })
        .await;
        match msg {
            Some(Core::Have(piece)) => haves.push(piece),
            _ => panic!("expected 4 haves, got {haves:?}"),
        }
    }
    haves.sort();
    assert_eq!(haves, vec![0, 1, 2, 3]);

    assert_eq!(handle.await.unwrap(), Status::Completed);
    assert_eq!(job.status().await, Status::Completed);

    assert_eq!(job.source_of(0).await, Some(a.addr));
    assert_eq!(job.source_of(1).await, Some(b.addr));
    assert_eq!(job.source_of(2).await, Some(a.addr));
    assert_eq!(job.source_of(3).await, Some(b.addr));

    let stats = job.peer_stats().await;
    assert_eq!(stats[&a.addr].pieces, 2);
    assert_eq!(stats[&b.addr].pieces, 2);

    assert_eq!(std::fs::read(&session.path).unwrap(), data);
    assert!(session.is_complete().await);
    assert_eq!(session.counter.downloaded(), data.len() as u64);
    assert!(announcer.events().contains(&Event::Completed));
}

#[tokio::test]
async fn peer_disconnects_mid_download() {
    setup();
    let (info, data) = torrent(3);
    let fake = fake_seeder(&info, &data, FakeMode::ServeOnly(vec![0])).await;
    let a = fake.addr;
    let b = seeder(&info, &data).await;

    let registries = Registries::new();
    let (session, _dir) = leecher_session(&info);
    let announcer = MockAnnouncer::new(vec![a, b.addr]);
    let job = DownloadJob::new(1, session.clone());

    let status = DownloadTask::new(job.clone(), registries, announcer, opts(), 50)
        .spawn()
        .await
        .unwrap();

    assert_eq!(status, Status::Completed);
    assert_eq!(job.source_of(0).await, Some(a));
    assert_eq!(job.source_of(1).await, Some(b.addr));
    // `a` closed the socket on this request, it was retried on `b`
    assert_eq!(job.source_of(2).await, Some(b.addr));
    assert_eq!(std::fs::read(&session.path).unwrap(), data);
}

#[tokio::test]
async fn corrupted_piece_is_rejected() {
    setup();
    let (info, data) = torrent(2);
    let fake = fake_seeder(&info, &data, FakeMode::Corrupt).await;
    let addr = fake.addr;

    let registries = Registries::new();
    let (session, _dir) = leecher_session(&info);
    session.open_for_download().await.unwrap();

    let conn = PeerConnection::connect(addr, session.clone(), registries.clone(), opts())
        .await
        .unwrap();
    conn.await_bootstrap().await.unwrap();
    assert!(conn.has_piece(1).await);

    let r = conn.download_piece(0).await;
    assert!(matches!(r, Err(Error::PieceInvalid(0))));
    assert!(!session.has_piece(0).await);
    assert_eq!(session.counter.downloaded(), 0);
    conn.close().await;

    // a job with only bad peers fails instead of waiting for more
    let job = DownloadJob::new(2, session);
    let status = DownloadTask::new(job, registries, MockAnnouncer::new(vec![addr]), opts(), 50)
        .spawn()
        .await
        .unwrap();
    assert!(matches!(status, Status::Failed(_)), "{status:?}");
}

// A request of a piece the seeder doesn't have gets no answer, and the
// connection keeps working.
#[tokio::test]
async fn missing_piece_is_not_answered() {
    setup();
    let (info, mut data) = torrent(3);
    let original = data.clone();
    // corrupt piece 1 on the seeder's disk
    data[PIECE_LEN as usize] ^= 0xff;
    let s = seeder(&info, &data).await;
    assert!(!s.session.has_piece(1).await);
    assert_eq!(s.session.have_count().await, 2);

    let mut socket = raw_connect(s.addr, &info).await;
    socket.send(Core::Interested).await.unwrap();
    let unchoke = next_matching(&mut socket, Duration::from_secs(5), |m| {
        matches!(m, Core::Unchoke)
    })
    .await;
    assert!(unchoke.is_some());

    let req = |index: u32| Core::Request(BlockInfo { index, begin: 0, len: 1024 });
    socket.send(req(1)).await.unwrap();
    socket.send(req(0)).await.unwrap();

    let msg = next_matching(&mut socket, Duration::from_secs(5), |m| {
        matches!(m, Core::Piece(_))
    })
    .await;
    let Some(Core::Piece(block)) = msg else {
        panic!("the connection was closed");
    };
    assert_eq!(block.index, 0);
    assert_eq!(block.block, original[..1024].to_vec());
}

#[tokio::test]
async fn interest_is_sent_once() {
    setup();
    let (info, data) = torrent(2);
    let fake = fake_seeder(&info, &data, FakeMode::Honest).await;

    let (session, _dir) = leecher_session(&info);
    session.open_for_download().await.unwrap();
    let registries = Registries::new();
    let conn = PeerConnection::connect(fake.addr, session, registries.clone(), opts())
        .await
        .unwrap();
    conn.await_bootstrap().await.unwrap();

    conn.send_interested().unwrap();
    conn.send_interested().unwrap();
    conn.download_piece(0).await.unwrap();
    conn.download_piece(1).await.unwrap();

    // the requests of both pieces were read after any interested frame
    assert_eq!(fake.requests.load(Ordering::SeqCst), 2);
    assert_eq!(fake.interested.load(Ordering::SeqCst), 1);

    conn.close().await;
    conn.close().await;
    assert!(conn.is_closed());
    assert_eq!(registries.connections.count(info.info_hash).await, 0);
}

// Only one block of a piece of three blocks is wrong, the whole piece is
// thrown away.
#[tokio::test]
async fn one_corrupted_block_rejects_the_piece() {
    setup();
    let (info, data) = torrent_with(PIECE_LEN * 3, 2, PIECE_LEN as usize);
    let mode = FakeMode::CorruptBlock { index: 0, begin: PIECE_LEN };
    let fake = fake_seeder(&info, &data, mode).await;

    let (session, _dir) = leecher_session(&info);
    session.open_for_download().await.unwrap();
    let conn = PeerConnection::connect(fake.addr, session.clone(), Registries::new(), opts())
        .await
        .unwrap();
    conn.await_bootstrap().await.unwrap();

    let r = conn.download_piece(0).await;
    assert!(matches!(r, Err(Error::PieceInvalid(0))), "{r:?}");
    assert_eq!(fake.requests.load(Ordering::SeqCst), 3);
    assert!(!session.has_piece(0).await);
    assert_eq!(session.counter.downloaded(), 0);

    // the other piece is served untouched
    conn.download_piece(1).await.unwrap();
    assert!(session.has_piece(1).await);
    conn.close().await;
}

#[tokio::test]
async fn pieces_of_many_blocks() {
    setup();
    let (info, data) = torrent_with(PIECE_LEN * 3, 3, PIECE_LEN as usize + 100);
    let s = seeder(&info, &data).await;

    let (session, _dir) = leecher_session(&info);
    assert_eq!(session.piece_len(2), PIECE_LEN + 100);

    let job = DownloadJob::new(1, session.clone());
    let status = DownloadTask::new(
        job,
        Registries::new(),
        MockAnnouncer::new(vec![s.addr]),
        opts(),
        50,
    )
    .spawn()
    .await
    .unwrap();

    assert_eq!(status, Status::Completed);
    assert_eq!(std::fs::read(&session.path).unwrap(), data);
    assert_eq!(s.session.counter.uploaded(), data.len() as u64);
}

#[tokio::test]
async fn cancelled_job_stops() {
    setup();
    let (info, _) = torrent(2);

    let (session, _dir) = leecher_session(&info);
    let job = DownloadJob::new(1, session);
    job.cancel();
    let status = DownloadTask::new(
        job.clone(),
        Registries::new(),
        MockAnnouncer::new(vec![]),
        opts(),
        50,
    )
    .spawn()
    .await
    .unwrap();

    assert_eq!(status, Status::Cancelled);
    assert_eq!(job.status().await, Status::Cancelled);
}

// The only peer never answers, the job is cancelled while it waits for the
// blocks and lets go of its connection right away.
#[tokio::test]
async fn cancel_while_waiting_for_blocks() {
    setup();
    let (info, data) = torrent(2);
    let hash = info.info_hash;
    let fake = fake_seeder(&info, &data, FakeMode::Stall).await;

    let registries = Registries::new();
    let (session, _dir) = leecher_session(&info);
    let job = DownloadJob::new(1, session.clone());
    let opts = PeerOptions { piece_timeout: Duration::from_secs(30), ..opts() };
    let handle = DownloadTask::new(
        job.clone(),
        registries.clone(),
        MockAnnouncer::new(vec![fake.addr]),
        opts,
        50,
    )
    .spawn();

    let requests = fake.requests.clone();
    wait_until(Duration::from_secs(5), || {
        let requests = requests.clone();
        async move { requests.load(Ordering::SeqCst) > 0 }
    })
    .await;
    assert_eq!(registries.connections.count(hash).await, 1);
    assert_eq!(job.status().await, Status::Downloading);

    let cancelled_at = Instant::now();
    job.cancel();
    let status = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    // well before the piece timeout
    assert_eq!(status, Status::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert_eq!(job.status().await, Status::Cancelled);
    assert_eq!(registries.connections.count(hash).await, 0);
    assert!(!registries.swarm.is_active(hash, &fake.addr).await);
    assert!(!session.has_piece(0).await);
}
