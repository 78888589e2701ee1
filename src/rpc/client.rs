//! Client side of the daemon RPC, used by the CLI subcommands.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to daemon at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("daemon closed the connection without replying")]
    NoResponse,

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

impl ClientError {
    /// The error code when the daemon answered with an error.
    pub fn rpc_code(&self) -> Option<i32> {
        match self {
            ClientError::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Opens one connection per call; the CLI makes few calls per process.
pub struct RpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call<P, T>(&self, method: &str, params: Option<&P>) -> Result<T, ClientError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(ClientError::Encode)?;
        self.call_raw(method, params).await
    }

    pub async fn call_no_params<T: DeserializeOwned>(&self, method: &str) -> Result<T, ClientError> {
        self.call_raw(method, None).await
    }

    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr,
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&Request::new(method, params, id))
            .map_err(ClientError::Encode)?;
        payload.push('\n');
        stream.write_all(payload.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::NoResponse);
        }

        let response: Response = serde_json::from_str(&line).map_err(ClientError::Decode)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(ClientError::Decode)
    }
}
