//! Metainfo is a .torrent file with information about the Torrent.
//! From a magnet link, the Info is downloaded from other peers.

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{AsString, Error, SingleItemEncoder, ToBencode},
};

use crate::{error, torrent::InfoHash};

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub creation_date: Option<u32>,
    pub info: Info,
}

impl MetaInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, error::Error> {
        Ok(Self::from_bencode(buf)?)
    }

    /// Every tracker of the torrent, `announce` first, without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut list = vec![self.announce.clone()];

        if let Some(l) = &self.announce_list {
            list.extend(l.iter().flatten().cloned());
        }

        let mut trackers: Vec<String> = Vec::with_capacity(list.len());
        for tracker in list {
            if !tracker.is_empty() && !trackers.contains(&tracker) {
                trackers.push(tracker);
            }
        }
        trackers
    }
}

/// Turn a tracker url into the `host:port` of an UDP tracker. Other schemes
/// are not supported.
pub fn udp_tracker_host(url: &str) -> Option<String> {
    let uri = urlencoding::decode(url).ok()?.to_string();
    let host = uri.strip_prefix("udp://")?;

    // remove any /announce
    let host = match host.find('/') {
        Some(i) => &host[..i],
        None => host,
    };
    Some(host.to_owned())
}

/// File related information, only the single-file format is supported.
/// <https://fileformats.fandom.com/wiki/Torrent_file>
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Length of the file, `None` on multi-file torrents.
    pub file_length: Option<u64>,

    /// name of the file
    pub name: String,

    /// length in bytes of each piece, the last piece may have a smaller length
    pub piece_length: u32,

    /// A (byte) string consisting of the concatenation of all 20-byte SHA1
    /// hash values, one per piece.
    pub pieces: Vec<u8>,

    // the following is computed while decoding, and not part of the dict.
    /// The bencoded dict exactly as received, served over ut_metadata.
    pub raw: Vec<u8>,
    pub info_hash: InfoHash,
}

impl Info {
    /// Build the info of a single file from its content.
    pub fn from_data(
        name: &str,
        piece_length: u32,
        data: &[u8],
    ) -> Result<Self, error::Error> {
        let pieces: Vec<u8> = data
            .chunks(piece_length as usize)
            .flat_map(|piece| sha1_smol::Sha1::from(piece).digest().bytes())
            .collect();

        let mut info = Info {
            file_length: Some(data.len() as u64),
            name: name.to_owned(),
            piece_length,
            pieces,
            ..Default::default()
        };
        info.raw = info.to_bencode()?;
        info.info_hash = Self::info_hash(&info.raw);
        Ok(info)
    }

    /// Decode an info dict downloaded from peers.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, error::Error> {
        Ok(Self::from_bencode(buf)?)
    }

    pub fn info_hash(buf: &[u8]) -> InfoHash {
        InfoHash(sha1_smol::Sha1::from(buf).digest().bytes())
    }

    /// Calculate how many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn hashes(&self) -> Vec<[u8; 20]> {
        self.pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect()
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"announce", &self.announce)?;

            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }

            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }

            if let Some(creation_date) = &self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }

            e.emit_pair(b"info", &self.info)
        })?;

        Ok(())
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), Error> {
        encoder.emit_dict(|mut e| {
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u32::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo {
            announce: announce.unwrap_or_default(),
            announce_list,
            info,
            comment,
            creation_date,
        })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        // the info hash is computed over the bytes as received, not over a
        // re-encoding that could drop unknown keys.
        let raw = object.try_into_dictionary()?.into_raw()?;
        let info_hash = Info::info_hash(raw);

        let mut decoder = Decoder::new(raw);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info {
            file_length,
            name,
            piece_length,
            pieces,
            raw: raw.to_vec(),
            info_hash,
        })
    }
}
