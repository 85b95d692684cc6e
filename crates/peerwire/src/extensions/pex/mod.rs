//! Peer exchange (ut_pex).
//!
//! <https://www.bittorrent.org/beps/bep_0011.html>

use std::net::SocketAddr;

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{AsString, ToBencode},
};

use crate::{
    error::Error,
    utils::{parse_compact_peers, to_compact_v4},
};

/// Most peers sent on a single PEX message.
pub const PEX_MAX_PEERS: usize = 50;

/// Peers that connected and disconnected since the last message, only IPv4
/// peers travel on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pex {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl Pex {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_bencode()?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(buf)?)
    }
}

impl ToBencode for Pex {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"added", AsString(to_compact_v4(&self.added)))?;
            e.emit_pair(b"dropped", AsString(to_compact_v4(&self.dropped)))
        })
    }
}

impl FromBencode for Pex {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut added = Vec::new();
        let mut dropped = Vec::new();

        let mut dict = object.try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"added", value) => {
                    let bytes = AsString::<Vec<u8>>::decode_bencode_object(value)
                        .context("added")?;
                    added = parse_compact_peers(&bytes.0, 6);
                }
                (b"dropped", value) => {
                    let bytes = AsString::<Vec<u8>>::decode_bencode_object(value)
                        .context("dropped")?;
                    dropped = parse_compact_peers(&bytes.0, 6);
                }
                _ => {}
            }
        }

        Ok(Self { added, dropped })
    }
}
