//! Types for the Metadata protocol codec.
//!
//! <http://www.bittorrent.org/beps/bep_0009.html>

mod codec;

// re-exports
pub use codec::*;

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::ToBencode,
};

use crate::error::Error;

/// The info dictionary is exchanged in pieces of 16 KiB, the last one may be
/// smaller.
pub const METADATA_PIECE_LEN: usize = 16384;

/// Metadata dict used in the Metadata protocol messages,
/// this dict is used to request, reject, and send data (info).
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    pub total_size: Option<u32>,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MetadataMsgType {
    Request = 0,
    Response = 1,
    Reject = 2,
}

impl TryFrom<u8> for MetadataMsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MetadataMsgType::*;
        match value {
            v if v == Request as u8 => Ok(Request),
            v if v == Response as u8 => Ok(Response),
            v if v == Reject as u8 => Ok(Reject),
            _ => Err(Error::BencodeError),
        }
    }
}

impl Metadata {
    pub fn request(piece: u32) -> Self {
        Self { msg_type: MetadataMsgType::Request, piece, total_size: None }
    }

    pub fn reject(piece: u32) -> Self {
        Self { msg_type: MetadataMsgType::Reject, piece, total_size: None }
    }

    pub fn response(piece: u32, total_size: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Response,
            piece,
            total_size: Some(total_size),
        }
    }

    /// Split the dictionary at the start of `buf` from the raw bytes that
    /// follow it.
    ///
    /// # Errors
    ///
    /// This function will return an error if the buffer does not start with a
    /// valid metadata dictionary.
    pub fn extract(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        // every value of the dict is an integer, so the end of the dict is
        // the first "ee"
        let end = buf
            .windows(2)
            .position(|w| w == b"ee")
            .ok_or(Error::BencodeError)?;

        let (dict, rest) = buf.split_at(end + 2);
        let metadata = Metadata::from_bencode(dict)?;

        Ok((metadata, rest))
    }
}

/// How many metadata pieces an info dictionary of `total_size` bytes has.
pub fn metadata_pieces(total_size: usize) -> u32 {
    total_size.div_ceil(METADATA_PIECE_LEN) as u32
}

impl FromBencode for Metadata {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut msg_type = None;
        let mut piece = None;
        let mut total_size = None;

        let mut dict_dec = object.try_into_dictionary()?;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"msg_type", value) => {
                    msg_type = u8::decode_bencode_object(value)
                        .context("msg_type")
                        .map(Some)?;
                }
                (b"piece", value) => {
                    piece = u32::decode_bencode_object(value)
                        .context("piece")
                        .map(Some)?;
                }
                (b"total_size", value) => {
                    total_size = u32::decode_bencode_object(value)
                        .context("total_size")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let msg_type =
            msg_type.ok_or_else(|| decoding::Error::missing_field("msg_type"))?;
        let piece = piece.ok_or_else(|| decoding::Error::missing_field("piece"))?;
        let msg_type = MetadataMsgType::try_from(msg_type)
            .map_err(|_| decoding::Error::unexpected_token("0, 1 or 2", "msg_type"))?;

        Ok(Self { msg_type, piece, total_size })
    }
}

impl ToBencode for Metadata {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"msg_type", self.msg_type as u8)?;
            e.emit_pair(b"piece", self.piece)?;
            if let Some(total_size) = self.total_size {
                e.emit_pair(b"total_size", total_size)?;
            };
            Ok(())
        })?;
        Ok(())
    }
}
