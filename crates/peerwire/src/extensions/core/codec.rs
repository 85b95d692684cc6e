use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo};
use crate::{bitfield::Bitfield, error::Error};

/// Largest frame we accept. A piece message carries at most 16 KiB, and
/// metadata pieces are also 16 KiB, this leaves room for big bitfields.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// The first value is the extended message id, which the receiver decided
/// when it sent its extension handshake in the `m` field. Id 0 is the
/// extension handshake itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

impl From<ExtendedMessage> for Core {
    fn from(value: ExtendedMessage) -> Self {
        Self::Extended(value)
    }
}

/// Core messages exchanged after a successful handshake.
/// These are from the vanilla protocol, with no extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Extended(ExtendedMessage),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for CoreId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            20 => Extended,
            v => return Err(v),
        })
    }
}

impl Core {
    /// Short name used on logs.
    pub fn name(&self) -> &'static str {
        match self {
            Core::KeepAlive => "keepalive",
            Core::Choke => "choke",
            Core::Unchoke => "unchoke",
            Core::Interested => "interested",
            Core::NotInterested => "not_interested",
            Core::Have(_) => "have",
            Core::Bitfield(_) => "bitfield",
            Core::Request(_) => "request",
            Core::Piece(_) => "piece",
            Core::Cancel(_) => "cancel",
            Core::Extended(_) => "extended",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreCodec;

/// Length prefix and id of a message with `payload` bytes after the id.
fn put_header(buf: &mut BytesMut, id: CoreId, payload: usize) {
    buf.reserve(5 + payload);
    buf.put_u32(1 + payload as u32);
    buf.put_u8(id as u8);
}

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(&mut self, item: Core, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Core::KeepAlive => buf.put_u32(0),
            Core::Choke => put_header(buf, CoreId::Choke, 0),
            Core::Unchoke => put_header(buf, CoreId::Unchoke, 0),
            Core::Interested => put_header(buf, CoreId::Interested, 0),
            Core::NotInterested => put_header(buf, CoreId::NotInterested, 0),
            Core::Have(index) => {
                put_header(buf, CoreId::Have, 4);
                buf.put_u32(index);
            }
            Core::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                put_header(buf, CoreId::Bitfield, bytes.len());
                buf.extend_from_slice(&bytes);
            }
            Core::Request(info) => {
                put_header(buf, CoreId::Request, 12);
                info.encode(buf);
            }
            Core::Piece(block) => {
                put_header(buf, CoreId::Piece, 8 + block.block.len());
                block.encode(buf);
            }
            Core::Cancel(info) => {
                put_header(buf, CoreId::Cancel, 12);
                info.encode(buf);
            }
            Core::Extended(ExtendedMessage(id, payload)) => {
                put_header(buf, CoreId::Extended, 1 + payload.len());
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn read_block_info(buf: &mut BytesMut) -> BlockInfo {
    BlockInfo { index: buf.get_u32(), begin: buf.get_u32(), len: buf.get_u32() }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // unknown ids are skipped here, returning `None` for them would stall
        // the stream when the next frame is already buffered.
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            let size =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Core::KeepAlive));
            }

            if size > MAX_MESSAGE_SIZE {
                return Err(Error::MessageTooLarge(size));
            }

            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let msg_id = buf.get_u8();

            let Ok(msg_id) = CoreId::try_from(msg_id) else {
                warn!("unknown message_id {msg_id:?}, skipping {size} bytes");
                buf.advance(size - 1);
                continue;
            };

            let payload_len = size - 1;
            let well_formed = match msg_id {
                CoreId::Choke
                | CoreId::Unchoke
                | CoreId::Interested
                | CoreId::NotInterested => payload_len == 0,
                CoreId::Have => payload_len == 4,
                CoreId::Request | CoreId::Cancel => payload_len == 12,
                CoreId::Piece => payload_len >= 8,
                CoreId::Extended => payload_len >= 1,
                CoreId::Bitfield => true,
            };

            if !well_formed {
                warn!("malformed {msg_id:?} with payload of {payload_len}");
                buf.advance(payload_len);
                return Err(Error::MessageResponse);
            }

            let msg = match msg_id {
                CoreId::Choke => Core::Choke,
                CoreId::Unchoke => Core::Unchoke,
                CoreId::Interested => Core::Interested,
                CoreId::NotInterested => Core::NotInterested,
                CoreId::Have => Core::Have(buf.get_u32()),
                CoreId::Bitfield => {
                    Core::Bitfield(Bitfield::from_vec(buf.split_to(payload_len).to_vec()))
                }
                CoreId::Request => Core::Request(read_block_info(buf)),
                CoreId::Cancel => Core::Cancel(read_block_info(buf)),
                CoreId::Piece => {
                    let index = buf.get_u32();
                    let begin = buf.get_u32();
                    let block = buf.split_to(payload_len - 8).to_vec();
                    Core::Piece(Block { index, begin, block })
                }
                CoreId::Extended => {
                    let id = buf.get_u8();
                    let payload = buf.split_to(payload_len - 1).to_vec();
                    Core::Extended(ExtendedMessage(id, payload))
                }
            };

            return Ok(Some(msg));
        }
    }
}
