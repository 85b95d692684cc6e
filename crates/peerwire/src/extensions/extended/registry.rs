//! Per-connection table of negotiated extension ids.
//!
//! Both sides choose their own ids in the `m` dict of the extension
//! handshake. A message we send uses the id the *peer* advertised, a message
//! we receive carries the id *we* advertised.

use tracing::debug;

use crate::{
    error::Error,
    extensions::{ExtendedMessage, MetadataMsg, Pex},
};

use super::{Extension, CLIENT_NAME, M};

pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";

/// Extensions supported by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Metadata,
    Pex,
}

impl ExtensionKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Metadata => UT_METADATA,
            Self::Pex => UT_PEX,
        }
    }
}

/// An extended message after dispatching on its id.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedMsg {
    Handshake(Extension),
    Metadata(MetadataMsg),
    Pex(Pex),
    /// An id we never advertised.
    Unknown(u8, Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    local: M,
    remote: Option<Extension>,
}

impl ExtensionRegistry {
    pub fn new(local: M) -> Self {
        Self { local, remote: None }
    }

    /// The extension handshake this side sends.
    pub fn local_handshake(
        &self,
        port: u16,
        metadata_size: Option<u32>,
    ) -> Extension {
        Extension {
            m: self.local,
            p: Some(port),
            v: Some(CLIENT_NAME.to_owned()),
            reqq: Some(250),
            metadata_size,
        }
    }

    pub fn record_handshake(&mut self, ext: &Extension) {
        debug!(
            "recording remote extensions ut_metadata={:?} ut_pex={:?}",
            ext.m.ut_metadata, ext.m.ut_pex
        );
        self.remote = Some(ext.clone());
    }

    /// The extension handshake received from the peer, if any.
    pub fn remote(&self) -> Option<&Extension> {
        self.remote.as_ref()
    }

    pub fn has_negotiated(&self) -> bool {
        self.remote.is_some()
    }

    /// The id the peer wants to receive `kind` with.
    pub fn remote_id(&self, kind: ExtensionKind) -> Option<u8> {
        self.remote.as_ref().and_then(|r| r.m.get(kind))
    }

    /// Both sides support `kind`.
    pub fn supports(&self, kind: ExtensionKind) -> bool {
        self.local.get(kind).is_some() && self.remote_id(kind).is_some()
    }

    /// Which extension an incoming id belongs to, by our own advertised ids.
    pub fn classify(&self, id: u8) -> Option<ExtensionKind> {
        [ExtensionKind::Metadata, ExtensionKind::Pex]
            .into_iter()
            .find(|kind| self.local.get(*kind) == Some(id))
    }

    pub fn decode(&self, msg: ExtendedMessage) -> Result<ExtendedMsg, Error> {
        if msg.0 == Extension::ID {
            return Ok(ExtendedMsg::Handshake(msg.try_into()?));
        }
        Ok(match self.classify(msg.0) {
            Some(ExtensionKind::Metadata) => {
                ExtendedMsg::Metadata(MetadataMsg::from_bytes(&msg.1)?)
            }
            Some(ExtensionKind::Pex) => ExtendedMsg::Pex(Pex::from_bytes(&msg.1)?),
            None => ExtendedMsg::Unknown(msg.0, msg.1),
        })
    }

    fn remote_id_or_err(&self, kind: ExtensionKind) -> Result<u8, Error> {
        self.remote_id(kind).ok_or(Error::ExtensionNotSupported(kind.name()))
    }

    pub fn encode_metadata(
        &self,
        msg: &MetadataMsg,
    ) -> Result<ExtendedMessage, Error> {
        let id = self.remote_id_or_err(ExtensionKind::Metadata)?;
        Ok(ExtendedMessage(id, msg.to_bytes()?))
    }

    pub fn encode_pex(&self, pex: &Pex) -> Result<ExtendedMessage, Error> {
        let id = self.remote_id_or_err(ExtensionKind::Pex)?;
        Ok(ExtendedMessage(id, pex.to_bytes()?))
    }
}
