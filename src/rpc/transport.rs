//! TCP listener with newline-delimited JSON framing.
//!
//! Each connection runs in its own task and may send any number of requests.
//! A line longer than `MAX_REQUEST_BYTES` gets an error reply and the
//! connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    /// Bind immediately so callers learn about port conflicts up front.
    pub async fn bind(bind_addr: SocketAddr, handler: MethodHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind RPC listener on {}", bind_addr))?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Client connected");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, handler).await {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                                debug!(peer = %peer, "Client disconnected");
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Upper bound on one request line. The largest request carries a single
/// storage config.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            break;
        }

        if line.len() > MAX_REQUEST_BYTES {
            warn!(peer = %peer, limit = MAX_REQUEST_BYTES, "Request too large, closing connection");
            let response = Response::invalid_request(
                Value::Null,
                &format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
            );
            write_response(&mut writer, &response).await?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => match request.validate() {
                Err(msg) => {
                    warn!(peer = %peer, error = msg, "Invalid request");
                    let id = request.id.clone().unwrap_or(Value::Null);
                    Response::invalid_request(id, msg)
                }
                Ok(()) if request.is_notification() => {
                    debug!(peer = %peer, method = %request.method, "Notification received");
                    handler.handle(request).await;
                    continue;
                }
                Ok(()) => {
                    debug!(peer = %peer, method = %request.method, "Request received");
                    handler.handle(request).await
                }
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "Parse error");
                Response::parse_error()
            }
        };

        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &Response) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::context::AppContext;
    use crate::core::MemorySettings;
    use crate::rpc::protocol::{INVALID_REQUEST, PARSE_ERROR};
    use tokio::io::AsyncBufRead;

    fn handler() -> Arc<MethodHandler> {
        let ctx = AppContext::new(AppConfig::default(), Arc::new(MemorySettings::new()));
        Arc::new(MethodHandler::new(ctx))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Response {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn answers_each_line_on_one_connection() {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server, peer(), handler()));

        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"migration.progress\",\"id\":1}\n\nnot json\n")
            .await
            .unwrap();

        let first = read_response(&mut reader).await;
        assert_eq!(first.id, Value::from(1));
        assert!(first.error.is_none());

        let second = read_response(&mut reader).await;
        assert_eq!(second.error.unwrap().code, PARSE_ERROR);

        writer.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_request_closes_connection() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(handle_connection(server, peer(), handler()));

        let (reader, mut writer) = tokio::io::split(client);
        let flood = tokio::spawn(async move {
            let junk = vec![b'x'; MAX_REQUEST_BYTES * 2];
            // The server stops reading once the limit is hit
            let _ = writer.write_all(&junk).await;
        });

        let mut reader = BufReader::new(reader);
        let response = read_response(&mut reader).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_REQUEST);
        assert!(error.message.contains("exceeds"));

        task.await.unwrap().unwrap();
        let mut rest = String::new();
        assert_eq!(reader.read_line(&mut rest).await.unwrap(), 0);
        flood.abort();
    }
}
