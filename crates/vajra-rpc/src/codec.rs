use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::messages::{Request, Response};

/// Deadline for `AssignTask` and `StopTest` calls.
pub const CONTROL_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for `Heartbeat` calls.
pub const HEARTBEAT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("call timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),
}

impl RpcError {
    /// True when the peer could not be reached at all (as opposed to a
    /// reachable peer answering with an error or a malformed frame).
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Io(_) | RpcError::Timeout | RpcError::Closed)
    }
}

/// One framed duplex connection: newline-delimited JSON, one envelope per
/// line. Used symmetrically — servers read [`Request`]s and write
/// [`Response`]s, clients the reverse.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        tracing::trace!(bytes = line.len(), "sending frame");
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one frame; `Ok(None)` signals a clean EOF.
    async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            tracing::debug!("peer closed the connection");
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<(), RpcError> {
        self.write_frame(request).await
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>, RpcError> {
        self.read_frame().await
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<(), RpcError> {
        self.write_frame(response).await
    }

    pub async fn read_response(&mut self) -> Result<Response, RpcError> {
        self.read_frame().await?.ok_or(RpcError::Closed)
    }

    /// Send one request and wait for its response on this connection.
    pub async fn round_trip(&mut self, request: &Request) -> Result<Response, RpcError> {
        self.send_request(request).await?;
        self.read_response().await
    }
}

/// One-shot call: connect, send, await the response, all within `deadline`.
///
/// `Response::Error` frames are surfaced as [`RpcError::Remote`].
pub async fn call(
    addr: impl ToSocketAddrs,
    request: &Request,
    deadline: Duration,
) -> Result<Response, RpcError> {
    let fut = async {
        let mut connection = Connection::connect(addr).await?;
        connection.round_trip(request).await
    };
    let response = tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| RpcError::Timeout)??;
    match response {
        Response::Error { message } => Err(RpcError::Remote(message)),
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
