//! Accepts the connections that other peers open to us.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tokio::{net::TcpListener, spawn, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    peer::{PeerConnection, PeerOptions},
    registries::Registries,
};

#[derive(Debug)]
pub struct PeerListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    registries: Arc<Registries>,
    opts: PeerOptions,
}

impl PeerListener {
    /// Bind the listener. The port that was actually bound replaces
    /// `opts.listen_port`, and our own address is registered so the swarm
    /// never hands it out.
    pub async fn bind(
        addr: SocketAddr,
        registries: Arc<Registries>,
        mut opts: PeerOptions,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        opts.listen_port = local_addr.port();

        registries.swarm.add_local_addr(local_addr).await;
        if local_addr.ip().is_unspecified() || local_addr.ip().is_loopback() {
            let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, local_addr.port()));
            registries.swarm.add_local_addr(loopback).await;
        }

        Ok(Self { listener, local_addr, registries, opts })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Options of the connections of this listener, with the bound port.
    pub fn opts(&self) -> &PeerOptions {
        &self.opts
    }

    pub fn spawn(self) -> JoinHandle<()> {
        spawn(self.run())
    }

    /// Accept connections until the task is aborted. Each connection is
    /// served on its own task.
    #[tracing::instrument(name = "listener", skip_all, fields(addr = %self.local_addr))]
    pub async fn run(self) {
        info!("accepting peers");

        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!("{addr} connected");

            let registries = self.registries.clone();
            let opts = self.opts.clone();

            spawn(async move {
                match PeerConnection::accept(socket, registries, opts).await {
                    Ok(conn) => conn.closed().await,
                    Err(e) => debug!("{addr} rejected: {e}"),
                }
            });
        }
    }
}
