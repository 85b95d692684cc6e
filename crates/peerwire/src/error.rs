use std::{io, net::SocketAddr};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{daemon::DaemonMsg, extensions::Core, torrent::InfoHash};

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<mpsc::error::SendError<DaemonMsg>> for Error {
    fn from(value: mpsc::error::SendError<DaemonMsg>) -> Self {
        Self::SendDaemonError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("String is not UTF-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer didn't send a handshake as the first message")]
    NoHandshake,

    #[error("The peer answered the handshake with a different info_hash")]
    InfoHashMismatch,

    #[error("The peer sent a message of {0} bytes, larger than allowed")]
    MessageTooLarge(usize),

    #[error("The peer does not support the `{0}` extension")]
    ExtensionNotSupported(&'static str),

    #[error("The response received from the peer is wrong")]
    MessageResponse,

    #[error("The peer rejected the metadata piece {0}")]
    MetadataRejected(u32),

    #[error("The metadata received does not match the info_hash")]
    MetadataInvalid,

    #[error("The piece {0} downloaded does not have a valid hash")]
    PieceInvalid(usize),

    #[error("The piece {index} should have {expected} bytes but {got} arrived")]
    PieceLength { index: usize, expected: usize, got: usize },

    #[error("The piece {0} does not exist in this torrent")]
    PieceOutOfBounds(usize),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("Could not connect to {0} in time")]
    ConnectTimeout(SocketAddr),

    #[error("The peer took to long to respond")]
    Timeout,

    #[error("No peers in the torrent")]
    NoPeers,

    #[error("Could not send message to Peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<Core>),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),

    #[error("Could not send message to Daemon: {0}")]
    SendDaemonError(String),

    #[error("Tracker resolved to no unusable addresses")]
    TrackerNoHosts,

    #[error("Tracker resolved to no unusable addresses")]
    TrackerSocketAddr,

    #[error("Could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("The response received from the tracker was wrong")]
    TrackerResponse,

    #[error(
        "The response length received from the tracker was less then 20 \
         bytes, when it should be larger"
    )]
    TrackerResponseLength,

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("Only udp:// trackers are supported, got `{0}`")]
    TrackerUnsupported(String),

    #[error("Error when reading magnet link")]
    MagnetLinkInvalid,

    #[error(
        "Your magnet does not have an info_hash, are you sure you copied the \
         entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error("Only single file torrents are supported")]
    MultiFileUnsupported,

    #[error("The torrent file is missing the `{0}` field")]
    MetaInfoField(&'static str),

    #[error("Could not find torrent {0}")]
    TorrentDoesNotExist(InfoHash),

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    NoDuplicateTorrent,

    #[error("Could not find the download job {0}")]
    JobNotFound(u64),

    #[error("The download was cancelled")]
    JobCancelled,

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Error while writing the configuration file")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("The extension ids must be distinct and larger than 0")]
    ConfigExtensionIds,

    #[error("The peer id must have exactly 20 bytes")]
    PeerIdInvalid,
}

impl Error {
    /// Errors caused by the network or by the remote peer going away.
    ///
    /// A job that only sees these errors is waiting for peers, it has not
    /// failed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::IO(_)
                | Error::PeerClosedSocket
                | Error::ConnectTimeout(_)
                | Error::Timeout
                | Error::HandshakeTimeout
                | Error::NoHandshake
                | Error::NoPeers
                | Error::SendErrorPeer(_)
        )
    }

    /// A piece arrived but its content is wrong.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::PieceInvalid(_) | Error::PieceLength { .. })
    }
}
