//! A torrent being downloaded or seeded, shared by every connection of the
//! torrent.

use std::{fmt::Display, io::SeekFrom, path::PathBuf};

use speedy::{Readable, Writable};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{Mutex, RwLock},
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    counter::Counter,
    error::Error,
    metainfo::Info,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; 20] =
            value.try_into().map_err(|_| Error::MagnetNoInfoHash)?;
        Ok(InfoHash(buff))
    }
}

/// The file of a torrent and the pieces of it that were verified.
#[derive(Debug)]
pub struct TorrentSession {
    pub info_hash: InfoHash,
    pub name: String,
    pub length: u64,
    pub piece_length: u32,
    hashes: Vec<[u8; 20]>,
    pub path: PathBuf,
    /// Trackers in the order they should be tried.
    pub trackers: Vec<String>,
    /// The bencoded info dict, served to peers over ut_metadata.
    info_bytes: Vec<u8>,
    file: Mutex<Option<File>>,
    /// Verified pieces, a bit is set only after its bytes are synced.
    bitfield: RwLock<Bitfield>,
    pub counter: Counter,
}

impl TorrentSession {
    /// Session of `info` that will be stored at `download_dir/name`.
    pub fn new(
        info: Info,
        download_dir: impl Into<PathBuf>,
        trackers: Vec<String>,
    ) -> Result<Self, Error> {
        let length = info.file_length.ok_or(Error::MultiFileUnsupported)?;

        if info.piece_length == 0 {
            return Err(Error::MetaInfoField("piece length"));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::MetaInfoField("pieces"));
        }

        let hashes = info.hashes();
        let expected = length.div_ceil(info.piece_length as u64) as usize;
        if hashes.len() != expected {
            warn!(
                "torrent {} has {} hashes but {expected} pieces",
                info.name,
                hashes.len()
            );
            return Err(Error::MetaInfoField("pieces"));
        }

        let mut path: PathBuf = download_dir.into();
        path.push(&info.name);

        Ok(Self {
            info_hash: info.info_hash,
            name: info.name,
            length,
            piece_length: info.piece_length,
            bitfield: RwLock::new(Bitfield::from_piece(hashes.len())),
            hashes,
            path,
            trackers,
            info_bytes: info.raw,
            file: Mutex::new(None),
            counter: Counter::new(),
        })
    }

    /// Session of a magnet link whose info dict is not known yet. It has no
    /// pieces and is only used to fetch the metadata from peers.
    pub fn pending(
        info_hash: InfoHash,
        name: Option<String>,
        download_dir: impl Into<PathBuf>,
        trackers: Vec<String>,
    ) -> Self {
        let name = name.unwrap_or_else(|| info_hash.to_string());
        let mut path: PathBuf = download_dir.into();
        path.push(&name);

        Self {
            info_hash,
            name,
            length: 0,
            piece_length: crate::extensions::BLOCK_LEN,
            hashes: Vec::new(),
            path,
            trackers,
            info_bytes: Vec::new(),
            file: Mutex::new(None),
            bitfield: RwLock::new(Bitfield::new()),
            counter: Counter::new(),
        }
    }

    /// The info dict is not known yet.
    pub fn is_pending(&self) -> bool {
        self.info_bytes.is_empty()
    }

    #[inline]
    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Real length of the piece, the last one may be shorter.
    pub fn piece_len(&self, index: usize) -> u32 {
        if index + 1 < self.piece_count() {
            return self.piece_length;
        }
        match self.length % self.piece_length as u64 {
            0 => self.piece_length,
            rem => rem as u32,
        }
    }

    pub fn expected_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.hashes.get(index)
    }

    /// Check `data` against the hash of the piece.
    pub fn verify(&self, index: usize, data: &[u8]) -> bool {
        self.expected_hash(index).is_some_and(|hash| {
            sha1_smol::Sha1::from(data).digest().bytes() == *hash
        })
    }

    pub fn info_bytes(&self) -> &[u8] {
        &self.info_bytes
    }

    pub fn metadata_size(&self) -> Option<u32> {
        (!self.info_bytes.is_empty()).then_some(self.info_bytes.len() as u32)
    }

    pub async fn bitfield(&self) -> Bitfield {
        self.bitfield.read().await.clone()
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        self.bitfield.read().await.has(index)
    }

    pub async fn have_count(&self) -> usize {
        self.bitfield.read().await.count_ones()
    }

    pub async fn is_complete(&self) -> bool {
        !self.is_pending() && self.bitfield.read().await.all()
    }

    pub async fn bytes_left(&self) -> u64 {
        let bitfield = self.bitfield.read().await;
        (0..self.piece_count())
            .filter(|i| !bitfield.has(*i))
            .map(|i| self.piece_len(i) as u64)
            .sum()
    }

    async fn open_file(&self) -> Result<File, Error> {
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent).await?;
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|_| Error::FolderOpenError(self.path.display().to_string()))
    }

    /// Create the output file with its final length, keeping what is
    /// already on disk.
    pub async fn open_for_download(&self) -> Result<(), Error> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            *file = Some(self.open_file().await?);
        }
        if let Some(f) = file.as_mut() {
            if f.metadata().await?.len() != self.length {
                f.set_len(self.length).await?;
            }
        }
        Ok(())
    }

    /// Hash the pieces already on disk and set the bits of the valid ones,
    /// returns how many pieces are valid.
    pub async fn verify_existing(&self) -> Result<usize, Error> {
        if tokio::fs::metadata(&self.path).await.is_err() {
            return Ok(0);
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_file().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(0);
        };

        let mut valid = Vec::new();
        let mut buf = vec![0u8; self.piece_length as usize];

        for index in 0..self.piece_count() {
            let len = self.piece_len(index) as usize;
            let offset = index as u64 * self.piece_length as u64;

            file.seek(SeekFrom::Start(offset)).await?;
            if file.read_exact(&mut buf[..len]).await.is_err() {
                break;
            }
            if self.verify(index, &buf[..len]) {
                valid.push(index);
            }
        }
        drop(guard);

        let mut bitfield = self.bitfield.write().await;
        for index in &valid {
            bitfield.safe_set(*index);
        }

        info!("{} has {} valid pieces on disk", self.name, valid.len());
        Ok(valid.len())
    }

    /// Write a verified piece and set its bit, the bytes are synced first.
    pub async fn write_piece(
        &self,
        index: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        if index >= self.piece_count() {
            return Err(Error::PieceOutOfBounds(index));
        }
        let expected = self.piece_len(index) as usize;
        if data.len() != expected {
            return Err(Error::PieceLength { index, expected, got: data.len() });
        }

        {
            let mut guard = self.file.lock().await;
            if guard.is_none() {
                *guard = Some(self.open_file().await?);
            }
            let Some(file) = guard.as_mut() else {
                return Err(Error::FolderOpenError(self.path.display().to_string()));
            };

            let offset = index as u64 * self.piece_length as u64;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_data().await?;
        }

        self.bitfield.write().await.safe_set(index);
        debug!("wrote piece {index} of {}", self.name);

        Ok(())
    }

    /// Read a block of a piece from disk, `None` if the file is shorter than
    /// the block.
    pub async fn read_block(
        &self,
        index: usize,
        begin: u32,
        len: u32,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_file().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(None);
        };

        let offset = index as u64 * self.piece_length as u64 + begin as u64;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).await?;
            if n == 0 {
                return Ok(None);
            }
            read += n;
        }

        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn session(data: &[u8], piece_length: u32) -> (TorrentSession, TempDir) {
        let dir = tempdir().unwrap();
        let info = Info::from_data("file.bin", piece_length, data).unwrap();
        (TorrentSession::new(info, dir.path(), vec![]).unwrap(), dir)
    }

    #[test]
    fn piece_lengths() {
        let (s, _dir) = session(&[1u8; 40], 16);
        assert_eq!(s.piece_count(), 3);
        assert_eq!(s.piece_len(0), 16);
        assert_eq!(s.piece_len(2), 8);

        let (s, _dir) = session(&[1u8; 32], 16);
        assert_eq!(s.piece_count(), 2);
        assert_eq!(s.piece_len(1), 16);
    }

    #[test]
    fn info_hash_debug() {
        let hash = InfoHash([0xab; 20]);
        assert_eq!(format!("{hash:?}"), "ababababab");
        assert_eq!(hash.to_string().len(), 40);
    }

    #[tokio::test]
    async fn write_then_read() {
        let data: Vec<u8> = (0..40u8).collect();
        let (s, _dir) = session(&data, 16);
        s.open_for_download().await.unwrap();

        assert!(matches!(
            s.write_piece(2, &data[..16]).await,
            Err(Error::PieceLength { index: 2, expected: 8, got: 16 })
        ));

        s.write_piece(1, &data[16..32]).await.unwrap();
        assert!(s.has_piece(1).await);
        assert!(!s.has_piece(0).await);
        assert_eq!(s.bytes_left().await, 24);

        let block = s.read_block(1, 4, 4).await.unwrap().unwrap();
        assert_eq!(block, data[20..24].to_vec());

        // past the end of the file
        assert_eq!(s.read_block(2, 0, 16).await.unwrap(), None);
    }

    #[tokio::test]
    async fn verify_existing_file() {
        let data: Vec<u8> = (0..40u8).collect();
        let (s, _dir) = session(&data, 16);

        assert_eq!(s.verify_existing().await.unwrap(), 0);

        let mut corrupted = data.clone();
        corrupted[20] ^= 0xff;
        create_dir_all(s.path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&s.path, &corrupted).await.unwrap();

        assert_eq!(s.verify_existing().await.unwrap(), 2);
        assert!(s.has_piece(0).await);
        assert!(!s.has_piece(1).await);
        assert!(s.has_piece(2).await);
        assert!(!s.is_complete().await);
    }

    #[tokio::test]
    async fn pending_session() {
        let hash = InfoHash([7u8; 20]);
        let dir = tempdir().unwrap();
        let s = TorrentSession::pending(hash, None, dir.path(), vec![]);
        assert!(s.is_pending());
        assert_eq!(s.piece_count(), 0);
        assert_eq!(s.metadata_size(), None);
        assert!(!s.is_complete().await);
        assert_eq!(s.name, hash.to_string());
    }
}
