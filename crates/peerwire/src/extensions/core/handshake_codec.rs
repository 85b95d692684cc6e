//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`CoreCodec`](super::CoreCodec), but care should be
//! taken not to discard the underlying receive and send buffers.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{
    bitfield::Reserved, error::Error, extensions::core::PSTR, peer::PeerId,
    torrent::InfoHash,
};

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        buf.reserve(Handshake::LEN);
        buf.put_u8(pstr_len);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the protocol length without consuming, the rest of the
        // handshake might not be here yet.
        if buf[0] as usize != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        if buf.len() < Handshake::LEN {
            return Ok(None);
        }

        let pstr_len = buf.get_u8();

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field tells which extensions the peer supports,
/// we only care about the extension protocol bit. The peer id is usually the
/// client name and version.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LEN: usize = 68;

    pub fn new(
        info_hash: impl Into<[u8; 20]>,
        peer_id: impl Into<[u8; 20]>,
    ) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: Reserved::supported().into(),
            info_hash: InfoHash(info_hash.into()),
            peer_id: PeerId(peer_id.into()),
        }
    }

    pub fn reserved(&self) -> Reserved {
        Reserved::from(self.reserved)
    }

    pub fn serialize(&self) -> Result<[u8; Self::LEN], Error> {
        let mut buf = [0u8; Self::LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Validate the handshake received from a peer, against ours.
    pub fn validate(&self, target: &Self) -> Result<(), Error> {
        if target.pstr_len != 19 {
            warn!("! handshake with wrong pstr_len, dropping connection");
            return Err(Error::HandshakeInvalid);
        }
        if target.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return Err(Error::HandshakeInvalid);
        }
        if self.info_hash != target.info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return Err(Error::InfoHashMismatch);
        }
        Ok(())
    }
}
