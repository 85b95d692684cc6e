//! A library for the BitTorrent peer protocol and for downloading a file
//! from many peers at once.
//!
//! Connections speak the core protocol of BEP 3, the extension protocol of
//! BEP 10, the metadata extension of BEP 9 and peer exchange (BEP 11). Peers
//! are discovered with UDP trackers (BEP 15), and by gossip between the
//! peers we are connected to.
//!
//! The [daemon] is the high-level API, it owns the listener, the torrents
//! and their download jobs, and is controlled with messages.
//!
//! # Example
//!
//! ```no_run
//! use peerwire::{config::Config, daemon::{Daemon, DaemonMsg}};
//!
//! # async fn run() -> Result<(), peerwire::error::Error> {
//! let config = Config::load().await?.resolve()?;
//! let mut daemon = Daemon::new(config).await?;
//! let tx = daemon.ctx.tx.clone();
//!
//! tokio::spawn(async move { daemon.run().await });
//!
//! tx.send(DaemonMsg::AddTorrent("debian.iso.torrent".into())).await?;
//! tx.send(DaemonMsg::PrintStatus).await?;
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod connections;
pub mod counter;
pub mod daemon;
pub mod download;
pub mod error;
pub mod extensions;
pub mod listener;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod registries;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod utils;
