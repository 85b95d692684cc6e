//! Types for the Extended protocol.
//! BEP 10 <https://www.bittorrent.org/beps/bep_0010.html>
mod codec;
mod registry;

// re-exports
pub use codec::*;
pub use registry::*;

use bendy::{
    decoding::{FromBencode, Object, ResultExt},
    encoding::ToBencode,
};

/// Client name sent on the `v` key of the extension handshake.
pub const CLIENT_NAME: &str = concat!("peerwire ", env!("CARGO_PKG_VERSION"));

/// This is the payload of the extension protocol handshake.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extension {
    /// messages (supported extensions)
    pub m: M,
    /// local TCP listen port
    pub p: Option<u16>,
    /// a string identifying the client and the version
    pub v: Option<String>,
    /// number of outstanding requests messages this client supports
    /// without dropping any.
    pub reqq: Option<u16>,
    /// added by BEP 9
    /// the size of the metadata file, which is the
    /// info-dictionary part of the metainfo(.torrent) file
    pub metadata_size: Option<u32>,
}

/// Lists the extensions a peer supports, and the id that the *sender* of
/// the dictionary wants to receive them with.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct M {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
}

impl M {
    pub fn get(&self, kind: ExtensionKind) -> Option<u8> {
        match kind {
            ExtensionKind::Metadata => self.ut_metadata,
            ExtensionKind::Pex => self.ut_pex,
        }
    }
}

impl ToBencode for M {
    const MAX_DEPTH: usize = 20;
    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(ut_metadata) = self.ut_metadata {
                e.emit_pair(b"ut_metadata", ut_metadata)?;
            }
            if let Some(ut_pex) = self.ut_pex {
                e.emit_pair(b"ut_pex", ut_pex)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for M {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut ut_metadata = None;
        let mut ut_pex = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"ut_metadata", value) => {
                    ut_metadata = u8::decode_bencode_object(value)
                        .context("ut_metadata")
                        .map(Some)?;
                }
                (b"ut_pex", value) => {
                    ut_pex =
                        u8::decode_bencode_object(value).context("ut_pex").map(Some)?;
                }
                _ => {}
            }
        }

        // an id of 0 means the extension was disabled
        Ok(Self {
            ut_metadata: ut_metadata.filter(|v| *v != 0),
            ut_pex: ut_pex.filter(|v| *v != 0),
        })
    }
}

impl ToBencode for Extension {
    const MAX_DEPTH: usize = 20;
    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"m", self.m)?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(p) = self.p {
                e.emit_pair(b"p", p)?;
            }
            if let Some(reqq) = self.reqq {
                e.emit_pair(b"reqq", reqq)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for Extension {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut p = None;
        let mut v = None;
        let mut reqq = None;
        let mut metadata_size = None;
        let mut m = M::default();

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => {
                    m = M::decode_bencode_object(value).context("m")?
                }
                (b"metadata_size", value) => {
                    metadata_size = u32::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"p", value) => {
                    p = u16::decode_bencode_object(value).context("p").map(Some)?;
                }
                (b"reqq", value) => {
                    reqq =
                        u16::decode_bencode_object(value).context("reqq").map(Some)?;
                }
                (b"v", value) => {
                    v = String::decode_bencode_object(value)
                        .context("v")
                        .map(Some)?;
                }
                _ => {}
            }
        }
        Ok(Self { m, p, v, reqq, metadata_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei5205e1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Transmission 2.94e
    const TRANSMISSION: &[u8] = b"d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei5205e1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Transmission 2.94e";

    #[test]
    fn from_bytes_to_extension() {
        let ext = Extension::from_bencode(TRANSMISSION).unwrap();

        assert_eq!(
            ext,
            Extension {
                m: M { ut_metadata: Some(3), ut_pex: Some(1) },
                p: Some(51413),
                v: Some("Transmission 2.94".to_owned()),
                reqq: Some(512),
                metadata_size: Some(5205),
            }
        );
    }

    // unknown keys such as `e` and `upload_only` are dropped
    #[test]
    fn from_extension_to_bytes() {
        let ext = Extension::from_bencode(TRANSMISSION).unwrap();
        let bytes = ext.to_bencode().unwrap();

        assert_eq!(
            bytes,
            b"d1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei5205e1:pi51413e4:reqqi512e1:v17:Transmission 2.94e".to_vec()
        );
    }

    #[test]
    fn disabled_extension() {
        let ext =
            Extension::from_bencode(b"d1:md11:ut_metadatai0e6:ut_pexi2eee").unwrap();
        assert_eq!(ext.m.ut_metadata, None);
        assert_eq!(ext.m.ut_pex, Some(2));
    }
}
