//! Length-framed multi-part messages over TCP.
//!
//! A message is a `u32` LE part count followed by each part as a `u32` LE
//! length and its bytes. Requests and responses use the same framing.

use crate::codec::Scalar;
use crate::errors::FuzzError;
use crate::protocol::{encode_termination, encode_value_request, Response, SessionId, Status};
use crate::server::ProtocolServer;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

pub const MAX_PARTS: u32 = 64;
pub const MAX_PART_LEN: u32 = 1 << 20;

fn transport_err(err: impl std::fmt::Display) -> FuzzError {
    FuzzError::Transport(err.to_string())
}

/// Reads one message. `Ok(None)` means the peer closed the connection
/// between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>, FuzzError>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32_le().await {
        Ok(count) => count,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(transport_err(e)),
    };
    if count > MAX_PARTS {
        return Err(FuzzError::Transport(format!(
            "message has {count} parts, limit is {MAX_PARTS}"
        )));
    }
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32_le().await.map_err(transport_err)?;
        if len > MAX_PART_LEN {
            return Err(FuzzError::Transport(format!(
                "part of {len} bytes exceeds limit {MAX_PART_LEN}"
            )));
        }
        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part).await.map_err(transport_err)?;
        parts.push(part);
    }
    Ok(Some(parts))
}

pub async fn write_message<W>(writer: &mut W, parts: &[Vec<u8>]) -> Result<(), FuzzError>
where
    W: AsyncWrite + Unpin,
{
    let count = u32::try_from(parts.len()).map_err(transport_err)?;
    writer.write_u32_le(count).await.map_err(transport_err)?;
    for part in parts {
        let len = u32::try_from(part.len()).map_err(transport_err)?;
        writer.write_u32_le(len).await.map_err(transport_err)?;
        writer.write_all(part).await.map_err(transport_err)?;
    }
    writer.flush().await.map_err(transport_err)
}

/// Accepts connections until `shutdown` resolves. Each connection gets its own
/// task; a connection may carry requests of any number of sessions.
pub async fn serve<F>(
    listener: TcpListener,
    server: Arc<ProtocolServer>,
    shutdown: F,
) -> Result<(), FuzzError>
where
    F: Future<Output = ()>,
{
    let local = listener.local_addr().map_err(transport_err)?;
    info!(%local, "protocol server listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(transport_err)?;
                debug!(%addr, "client connected");
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, server).await {
                        error!(%addr, error = %e, "client handler error");
                    }
                });
            }
        }
    }
}

async fn handle_client(stream: TcpStream, server: Arc<ProtocolServer>) -> Result<(), FuzzError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    while let Some(parts) = read_message(&mut reader).await? {
        let server = Arc::clone(&server);
        let response = tokio::task::spawn_blocking(move || server.handle(&parts))
            .await
            .map_err(transport_err)?;
        write_message(&mut writer, &response.into_parts()).await?;
    }
    Ok(())
}

/// Async client for one connection.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self, FuzzError> {
        let stream = TcpStream::connect(addr).await.map_err(transport_err)?;
        stream.set_nodelay(true).map_err(transport_err)?;
        Ok(Self { stream })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, FuzzError> {
        self.stream.peer_addr().map_err(transport_err)
    }

    pub async fn request(&mut self, parts: &[Vec<u8>]) -> Result<Response, FuzzError> {
        write_message(&mut self.stream, parts).await?;
        let reply = read_message(&mut self.stream)
            .await?
            .ok_or_else(|| FuzzError::Transport("server closed the connection".to_string()))?;
        Response::from_parts(&reply)
    }

    /// Asks for a value in `[lo, hi]` and decodes it. Error statuses become
    /// [`FuzzError::Protocol`].
    pub async fn value(
        &mut self,
        session: &SessionId,
        decision_id: u64,
        lo: Scalar,
        hi: Scalar,
    ) -> Result<Scalar, FuzzError> {
        let response = self
            .request(&encode_value_request(session, decision_id, lo, hi))
            .await?;
        response.value_as(lo.tag())
    }

    pub async fn terminate(&mut self, session: &SessionId, success: bool) -> Result<(), FuzzError> {
        let response = self.request(&encode_termination(session, success)).await?;
        match response.status {
            Status::OkTerminal => Ok(()),
            status => Err(FuzzError::Protocol(format!(
                "termination of {session} answered with {status}"
            ))),
        }
    }
}
