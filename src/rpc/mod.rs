//! JSON-RPC 2.0 over TCP between the daemon and the `blobshift` client.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: listener with newline-delimited framing
//! - `methods`: dispatch onto [`AppContext`] services
//! - `client`: one-shot calls from the CLI

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{DaemonStatus, LogPage, MethodHandler, ProgressView};
pub use protocol::{CONFLICT, REJECTED, Request, Response, RpcError, STORAGE_ERROR};

pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, MethodHandler::new(ctx)).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            transport,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until [`RpcServer::shutdown`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
