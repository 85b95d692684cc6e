use std::fmt::Display;

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};

use crate::error::Error;

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// A new id in the Azureus style, `prefix` followed by random
    /// alphanumerics.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
        id[..prefix.len()].copy_from_slice(prefix);

        let mut rng = rand::thread_rng();
        for b in id.iter_mut().skip(prefix.len()) {
            *b = rng.sample(Alphanumeric);
        }
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Peer ids on the config file are written as 20 ASCII characters.
impl TryFrom<&str> for PeerId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let buff: [u8; 20] =
            value.as_bytes().try_into().map_err(|_| Error::PeerIdInvalid)?;
        Ok(PeerId(buff))
    }
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Protocol state of a connection. Messages keep flowing on `Ready`, it
/// only marks that the bootstrap is done.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    NegotiatingExtensions = 2,
    AwaitingBitfield = 3,
    Ready = 4,
    Closed = 5,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::NegotiatingExtensions,
            3 => Self::AwaitingBitfield,
            4 => Self::Ready,
            _ => Self::Closed,
        }
    }
}
