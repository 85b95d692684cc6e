use clap::Parser;
use peerwire::{
    config::Config,
    daemon::{Daemon, DaemonMsg},
    error::Error,
};
use peerwire_daemon::Args;
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .without_time()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("could not set the default tracing subscriber");
    }

    let r = run(args).await;
    if let Err(e) = &r {
        error!("{e}");
    }
    r
}

async fn run(args: Args) -> Result<(), Error> {
    let config = match &args.config {
        Some(path) => Config::load_from(path).await,
        None => Config::load().await,
    };
    let mut config = config.unwrap_or_else(|e| {
        warn!("could not load the configuration, using the defaults: {e}");
        Config::default()
    });
    args.apply(&mut config);

    let mut daemon = Daemon::new(config.resolve()?).await?;
    daemon.quit_after_complete = args.quit_after_complete;
    let tx = daemon.ctx.tx.clone();

    for path in args.torrent {
        tx.send(DaemonMsg::AddTorrent(path)).await?;
    }
    for magnet in args.magnet {
        tx.send(DaemonMsg::AddMagnet(magnet)).await?;
    }

    tokio::spawn(read_commands(tx));

    daemon.run().await
}

/// Forward the commands typed on stdin to the daemon:
/// `status`, `retry <id>`, `cancel <id>`, `add <path>`, `magnet <uri>`
/// and `quit`.
async fn read_commands(tx: mpsc::Sender<DaemonMsg>) {
    let mut lines = BufReader::new(stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        let msg = match (words.next(), words.next()) {
            (Some("status"), _) => DaemonMsg::PrintStatus,
            (Some("quit"), _) => DaemonMsg::Quit,
            (Some("add"), Some(path)) => DaemonMsg::AddTorrent(path.into()),
            (Some("magnet"), Some(uri)) => DaemonMsg::AddMagnet(uri.to_owned()),
            (Some(cmd @ ("retry" | "cancel")), Some(id)) => {
                let Ok(id) = id.parse::<u64>() else {
                    warn!("`{id}` is not a job id");
                    continue;
                };
                if cmd == "retry" {
                    DaemonMsg::Retry(id)
                } else {
                    DaemonMsg::Cancel(id)
                }
            }
            (None, _) => continue,
            (Some(cmd), _) => {
                warn!("unknown command `{cmd}`");
                continue;
            }
        };

        if tx.send(msg).await.is_err() {
            break;
        }
    }
}
