//! Handle magnet link
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, torrent::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet(pub Magnet_);

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Magnet {
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        Ok(Self(
            Magnet_::new(magnet_url).map_err(|_| Error::MagnetLinkInvalid)?,
        ))
    }

    /// The name will come URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> Option<String> {
        let dn = self.0.dn.as_ref()?;
        let dn = urlencoding::decode(dn).ok()?;
        Some(dn.replace('+', " "))
    }

    /// Transform the hex "xt" field into an info hash.
    pub fn parse_xt(&self) -> Result<InfoHash, Error> {
        let xt = self.0.xt.as_deref().ok_or(Error::MagnetNoInfoHash)?;
        let xt = xt.strip_prefix("urn:btih:").unwrap_or(xt);

        let bytes = hex::decode(xt).map_err(|_| Error::MagnetNoInfoHash)?;
        InfoHash::try_from(bytes.as_slice())
    }

    /// URL decoded trackers, empty `tr` entries are skipped.
    pub fn parse_trackers(&self) -> Vec<String> {
        let mut trackers: Vec<String> = Vec::new();

        for tr in &self.0.tr {
            let Ok(tr) = urlencoding::decode(tr) else { continue };
            let tr = tr.trim();
            if tr.is_empty() || trackers.iter().any(|t| t == tr) {
                continue;
            }
            trackers.push(tr.to_owned());
        }

        trackers
    }
}
