//! Configuration file of the daemon.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{info, warn};

use crate::{
    error::Error,
    extensions::M,
    peer::{PeerId, PeerOptions},
};

/// Prefix of the peer ids generated by this client.
pub const PEER_ID_PREFIX: &str = "-PW0001-";

/// Values of the configuration file, every key is optional.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    pub listen_port: u16,
    /// 20 ASCII characters.
    pub peer_id: String,
    pub max_connections: u32,
    pub tracker_timeout_secs: u64,
    pub reannounce_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub piece_timeout_secs: u64,
    pub metadata_ext_id: u8,
    pub pex_ext_id: u8,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("downloads"));

        let peer_id = PeerId::generate(PEER_ID_PREFIX);

        Self {
            download_dir,
            listen_port: 6881,
            peer_id: String::from_utf8_lossy(&peer_id.0).into_owned(),
            max_connections: 50,
            tracker_timeout_secs: 30,
            reannounce_interval_secs: 15,
            connect_timeout_secs: 10,
            piece_timeout_secs: 30,
            metadata_ext_id: 3,
            pex_ext_id: 4,
        }
    }
}

impl Config {
    /// Path of the configuration file in the user's config folder.
    ///
    /// # Errors
    ///
    /// Fails if the user has no home folder.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "Peerwire").ok_or(Error::HomeInvalid)?;
        Ok(dotfile.config_dir().join("config.toml"))
    }

    /// Load the configuration file of the user, see [`Config::load_from`].
    pub async fn load() -> Result<Self, Error> {
        Self::load_from(&Self::config_path()?).await
    }

    /// Load the configuration at `path`. If the file does not exist, or it is
    /// not a valid configuration, the defaults are written to it.
    pub async fn load_from(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .map_err(|_| Error::FolderOpenError(parent.display().to_string()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match toml::from_str::<Config>(&dst) {
            Ok(config) if !dst.trim().is_empty() => Ok(config),
            r => {
                if let Err(e) = r {
                    warn!("invalid configuration file, writing the defaults: {e}");
                }
                let config = Config::default();
                let config_str = toml::to_string(&config)?;

                let mut file = OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .await?;
                file.write_all(config_str.as_bytes()).await?;

                info!("wrote default configuration to {}", path.display());
                Ok(config)
            }
        }
    }

    /// Validate the values and convert them to the types used by the client.
    pub fn resolve(self) -> Result<ResolvedConfig, Error> {
        let local_peer_id = PeerId::try_from(self.peer_id.as_str())?;

        if self.metadata_ext_id == 0
            || self.pex_ext_id == 0
            || self.metadata_ext_id == self.pex_ext_id
        {
            return Err(Error::ConfigExtensionIds);
        }

        Ok(ResolvedConfig {
            download_dir: self.download_dir,
            listen_port: self.listen_port,
            local_peer_id,
            max_connections: self.max_connections as usize,
            tracker_timeout: Duration::from_secs(self.tracker_timeout_secs),
            reannounce_interval: Duration::from_secs(self.reannounce_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            piece_timeout: Duration::from_secs(self.piece_timeout_secs),
            extensions: M {
                ut_metadata: Some(self.metadata_ext_id),
                ut_pex: Some(self.pex_ext_id),
            },
        })
    }
}

/// The configuration after the CLI flags were applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub download_dir: PathBuf,
    pub listen_port: u16,
    pub local_peer_id: PeerId,
    pub max_connections: usize,
    pub tracker_timeout: Duration,
    pub reannounce_interval: Duration,
    pub connect_timeout: Duration,
    pub piece_timeout: Duration,
    pub extensions: M,
}

impl ResolvedConfig {
    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            local_peer_id: self.local_peer_id.clone(),
            listen_port: self.listen_port,
            extensions: self.extensions,
            connect_timeout: self.connect_timeout,
            piece_timeout: self.piece_timeout,
        }
    }
}
