//! The handshake of a new connection, before switching to the
//! [`CoreCodec`].

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::{
    error::Error,
    extensions::{CoreCodec, Handshake, HandshakeCodec},
    peer::PeerId,
    torrent::InfoHash,
};

/// Switch the codec of the socket without discarding the buffers, the peer
/// may have pipelined messages right after its handshake.
pub fn into_core(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, CoreCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, CoreCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

/// Read the handshake of the peer, bounded by `wait`.
pub async fn read_handshake(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
    wait: Duration,
) -> Result<Handshake, Error> {
    match timeout(wait, socket.next()).await {
        Ok(Some(Ok(handshake))) => Ok(handshake),
        Ok(Some(Err(e))) => {
            warn!("invalid handshake: {e}");
            Err(Error::HandshakeInvalid)
        }
        Ok(None) => Err(Error::NoHandshake),
        Err(_) => Err(Error::HandshakeTimeout),
    }
}

/// We initiated the connection: send our handshake first, then validate
/// theirs.
pub async fn outbound(
    socket: TcpStream,
    info_hash: InfoHash,
    local_peer_id: PeerId,
    wait: Duration,
) -> Result<(Framed<TcpStream, CoreCodec>, Handshake), Error> {
    let remote = socket.peer_addr()?;
    let mut socket = Framed::new(socket, HandshakeCodec);

    let ours = Handshake::new(info_hash, local_peer_id);

    debug!("{remote} > handshake");
    socket.send(ours.clone()).await?;

    let theirs = read_handshake(&mut socket, wait).await?;
    debug!("{remote} < handshake");
    ours.validate(&theirs)?;

    Ok((into_core(socket), theirs))
}

/// The peer initiated the connection and its handshake was already read
/// with [`read_handshake`], answer with ours.
pub async fn reply_inbound(
    mut socket: Framed<TcpStream, HandshakeCodec>,
    theirs: &Handshake,
    local_peer_id: PeerId,
) -> Result<Framed<TcpStream, CoreCodec>, Error> {
    let ours = Handshake::new(theirs.info_hash, local_peer_id);
    ours.validate(theirs)?;

    debug!("> handshake reply");
    socket.send(ours).await?;

    Ok(into_core(socket))
}
