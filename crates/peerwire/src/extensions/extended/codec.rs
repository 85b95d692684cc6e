//! Conversions between the extension handshake and [`ExtendedMessage`].

use bendy::{decoding::FromBencode, encoding::ToBencode};

use crate::{error::Error, extensions::ExtendedMessage};

use super::Extension;

impl Extension {
    /// handshake ID
    pub const ID: u8 = 0;
}

impl TryFrom<ExtendedMessage> for Extension {
    type Error = Error;

    fn try_from(value: ExtendedMessage) -> Result<Self, Self::Error> {
        if value.0 != Self::ID {
            return Err(Error::MessageResponse);
        }
        Ok(Extension::from_bencode(&value.1)?)
    }
}

impl TryFrom<Extension> for ExtendedMessage {
    type Error = Error;

    fn try_from(value: Extension) -> Result<Self, Self::Error> {
        let buf = value.to_bencode()?;
        Ok(ExtendedMessage(Extension::ID, buf))
    }
}
