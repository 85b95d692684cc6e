//! Messages of the metadata protocol and their wire form.

use bendy::encoding::ToBencode;

use crate::error::Error;

use super::{Metadata, MetadataMsgType, METADATA_PIECE_LEN};

/// Messages of the extended metadata protocol, used to exchange pieces of the
/// `Info` of a metadata file.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMsg {
    /// msg_type: 0
    Request(u32),

    /// msg_type: 1, the dict is followed by the raw bytes of the piece.
    Data { piece: u32, total_size: u32, payload: Vec<u8> },

    /// msg_type: 2
    Reject(u32),
}

impl MetadataMsg {
    pub const fn msg_type(&self) -> MetadataMsgType {
        match self {
            Self::Request(..) => MetadataMsgType::Request,
            Self::Data { .. } => MetadataMsgType::Response,
            Self::Reject(..) => MetadataMsgType::Reject,
        }
    }

    pub const fn piece(&self) -> u32 {
        match self {
            Self::Request(piece) | Self::Reject(piece) => *piece,
            Self::Data { piece, .. } => *piece,
        }
    }

    /// Build the `Data` answer for `piece` of the bencoded `info`, or `None`
    /// if the piece is past the end of the info.
    pub fn data(piece: u32, info: &[u8]) -> Option<Self> {
        let start = piece as usize * METADATA_PIECE_LEN;
        if start >= info.len() {
            return None;
        }
        let end = (start + METADATA_PIECE_LEN).min(info.len());

        Some(Self::Data {
            piece,
            total_size: info.len() as u32,
            payload: info[start..end].to_vec(),
        })
    }

    /// Payload of the extended message, without the extended id.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(match self {
            Self::Request(piece) => Metadata::request(*piece).to_bencode()?,
            Self::Reject(piece) => Metadata::reject(*piece).to_bencode()?,
            Self::Data { piece, total_size, payload } => {
                let mut buf =
                    Metadata::response(*piece, *total_size).to_bencode()?;
                buf.extend_from_slice(payload);
                buf
            }
        })
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let (dict, payload) = Metadata::extract(buf)?;

        Ok(match dict.msg_type {
            MetadataMsgType::Request => Self::Request(dict.piece),
            MetadataMsgType::Reject => Self::Reject(dict.piece),
            MetadataMsgType::Response => Self::Data {
                piece: dict.piece,
                total_size: dict.total_size.ok_or(Error::MetadataInvalid)?,
                payload: payload.to_vec(),
            },
        })
    }
}
