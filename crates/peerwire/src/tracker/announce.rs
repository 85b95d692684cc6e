use speedy::{BigEndian, Readable, Writable};

use crate::{error::Error, peer::PeerId, torrent::InfoHash};

use super::{action::Action, event::Event};

#[derive(Debug, PartialEq, Clone, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: Action,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: Event,
    /// 0 lets the tracker use the source address of the packet.
    pub ip_address: u32,
    pub key: u32,
    /// -1 is the tracker default.
    pub num_want: i32,
    pub port: u16,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            connection_id: 0,
            action: Action::Announce,
            transaction_id: rand::random::<u32>(),
            info_hash: InfoHash::default(),
            peer_id: PeerId::default(),
            downloaded: 0,
            left: u64::MAX,
            uploaded: 0,
            event: Event::default(),
            ip_address: 0,
            key: rand::random::<u32>(),
            num_want: -1,
            port: 6881,
        }
    }
}

impl Request {
    pub const LENGTH: usize = 98;

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }
}

#[derive(Debug, PartialEq, Readable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    // compact peers follow
}

impl Response {
    pub(crate) const MIN_LEN: usize = 20;

    /// The header and the compact peer list that follows it.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Response::MIN_LEN {
            return Err(Error::TrackerResponseLength);
        }

        let res =
            Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::MIN_LEN])?;

        Ok((res, &buf[Self::MIN_LEN..]))
    }

    pub fn answers(&self, req: &Request) -> bool {
        self.transaction_id == req.transaction_id
            && self.action == Action::Announce as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let req = Request {
            connection_id: 1,
            info_hash: InfoHash([2u8; 20]),
            peer_id: PeerId([3u8; 20]),
            left: 100,
            event: Event::Completed,
            port: 6882,
            ..Default::default()
        };
        let buf = req.serialize().unwrap();

        assert_eq!(buf.len(), Request::LENGTH);
        assert_eq!(&buf[0..8], &1u64.to_be_bytes());
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[16..36], &[2u8; 20]);
        assert_eq!(&buf[36..56], &[3u8; 20]);
        assert_eq!(&buf[64..72], &100u64.to_be_bytes());
        assert_eq!(&buf[80..84], &1u32.to_be_bytes());
        assert_eq!(&buf[92..96], &(-1i32).to_be_bytes());
        assert_eq!(&buf[96..98], &6882u16.to_be_bytes());
    }

    #[test]
    fn response_with_peers() {
        let mut buf = Vec::new();
        for v in [1u32, 5, 1800, 2, 3] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);

        let (res, peers) = Response::deserialize(&buf).unwrap();
        assert_eq!(res.interval, 1800);
        assert_eq!(res.seeders, 3);
        assert_eq!(peers, &[127, 0, 0, 1, 0x1a, 0xe1]);

        assert!(matches!(
            Response::deserialize(&buf[..12]),
            Err(Error::TrackerResponseLength)
        ));
    }
}
