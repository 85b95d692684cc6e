use std::path::PathBuf;

use clap::Parser;
use peerwire::config::Config;
use tracing::Level;

#[derive(Parser, Debug)]
#[clap(name = "peerwired")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Read the configuration from this file instead of the default one.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// The directory in which torrents will be downloaded
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Accept connections of other peers on this port.
    #[clap(short, long)]
    pub listen_port: Option<u16>,

    /// Our peer id, exactly 20 ASCII characters.
    #[clap(long)]
    pub peer_id: Option<String>,

    /// Maximum number of connections of a download.
    #[clap(long)]
    pub max_connections: Option<u32>,

    /// One of: trace, debug, info, warn, error.
    #[clap(long, default_value = "info")]
    pub log_level: Level,

    /// Download the torrent of a `.torrent` file, may be repeated.
    #[clap(short, long)]
    pub torrent: Vec<PathBuf>,

    /// Download a torrent using it's magnet link, wrapped in quotes. May be
    /// repeated.
    #[clap(short, long)]
    pub magnet: Vec<String>,

    /// If the program should quit after all torrents are fully downloaded
    #[clap(short, long)]
    pub quit_after_complete: bool,
}

impl Args {
    /// Flags take precedence over the configuration file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(peer_id) = &self.peer_id {
            config.peer_id = peer_id.clone();
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "peerwired",
            "--listen-port",
            "7000",
            "-d",
            "/tmp/pw",
            "-t",
            "a.torrent",
            "-t",
            "b.torrent",
            "--log-level",
            "debug",
        ]);

        let mut config = Config::default();
        let peer_id = config.peer_id.clone();
        args.apply(&mut config);

        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/pw"));
        assert_eq!(config.peer_id, peer_id);
        assert_eq!(args.torrent.len(), 2);
        assert_eq!(args.log_level, Level::DEBUG);
        assert!(!args.quit_after_complete);
    }
}
