//! Raw tunnels for interactive sessions (kernel channels, terminals).
//!
//! The client connection is taken away from the HTTP layer, the original
//! request is replayed onto a fresh connection to the sandbox, and the two
//! connections are spliced together. The sandbox performs the protocol
//! upgrade itself; the gateway only moves bytes.
//!
//! A session ends as soon as either copy direction ends. The other direction
//! is abandoned, not drained: bytes it still had in flight may be lost. Both
//! connections are then closed.

use crate::conn::{Hijacked, RawConnectionAccess, RequestHead};
use crate::error::{CopyError, DialError, ForwardError, TunnelError};
use crate::sandbox::SandboxEndpoint;
use http::StatusCode;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// One half of a splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToSandbox,
    SandboxToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToSandbox => f.write_str("client->sandbox"),
            Direction::SandboxToClient => f.write_str("sandbox->client"),
        }
    }
}

/// How a spliced session ended.
#[derive(Debug)]
pub struct SessionEnd {
    /// The direction that finished first.
    pub first: Direction,
    /// Bytes copied by that direction, or the error that stopped it.
    pub result: Result<u64, CopyError>,
}

#[derive(Debug, Clone)]
pub struct TunnelHandler {
    endpoint: SandboxEndpoint,
    connect_timeout: Duration,
}

impl TunnelHandler {
    pub fn new(endpoint: SandboxEndpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }

    /// Open a new TCP connection to the sandbox.
    pub async fn dial(&self) -> Result<TcpStream, DialError> {
        let addr = self.endpoint.authority();
        match timeout(self.connect_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(DialError { addr, source }),
            Err(_) => Err(DialError {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    /// Run one tunnel session to completion.
    ///
    /// Setup failures are answered with an HTTP error while that is still
    /// possible. Once the connection is hijacked, failures just close it.
    pub async fn handle<C>(&self, mut conn: C, request: &RequestHead) -> Result<SessionEnd, TunnelError>
    where
        C: RawConnectionAccess,
    {
        let sandbox = match self.dial().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Error dialing tunnel backend: {}", err);
                if let Err(e) = conn
                    .respond_error(StatusCode::BAD_GATEWAY, "Error contacting backend server.")
                    .await
                {
                    debug!("Failed to send error response: {}", e);
                }
                return Err(err.into());
            }
        };
        self.attach(conn, sandbox, request).await
    }

    /// Hijack the client and splice it onto an already dialed sandbox stream.
    async fn attach<C, S>(
        &self,
        mut conn: C,
        mut sandbox: S,
        request: &RequestHead,
    ) -> Result<SessionEnd, TunnelError>
    where
        C: RawConnectionAccess,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Hijacked {
            io: client,
            buffered,
        } = match conn.hijack() {
            Ok(hijacked) => hijacked,
            Err(err) => {
                error!("Hijack error: {}", err);
                if let Err(e) = conn
                    .respond_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Connection cannot be tunneled.",
                    )
                    .await
                {
                    debug!("Failed to send error response: {}", e);
                }
                return Err(err.into());
            }
        };

        if let Err(err) = forward_request(&mut sandbox, request, &buffered).await {
            warn!("Error copying request to tunnel backend: {}", err);
            return Err(err.into());
        }

        debug!(sandbox = %self.endpoint, "Tunnel established");
        Ok(splice(client, sandbox).await)
    }
}

/// Write the request head, then any bytes that arrived after it.
async fn forward_request<W>(
    sandbox: &mut W,
    request: &RequestHead,
    buffered: &[u8],
) -> Result<(), ForwardError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    request.encode(&mut head);
    sandbox.write_all(&head).await?;
    if !buffered.is_empty() {
        sandbox.write_all(buffered).await?;
    }
    sandbox.flush().await?;
    Ok(())
}

/// Copy bytes both ways until the first direction finishes, then close both.
pub async fn splice<A, B>(client: A, sandbox: B) -> SessionEnd
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut sandbox_read, mut sandbox_write) = tokio::io::split(sandbox);

    let client_to_sandbox = tokio::io::copy(&mut client_read, &mut sandbox_write);
    let sandbox_to_client = tokio::io::copy(&mut sandbox_read, &mut client_write);

    let (first, result) = tokio::select! {
        result = client_to_sandbox => (Direction::ClientToSandbox, result),
        result = sandbox_to_client => (Direction::SandboxToClient, result),
    };

    let _ = client_write.shutdown().await;
    let _ = sandbox_write.shutdown().await;

    match &result {
        Ok(bytes) => debug!(%first, bytes, "Tunnel closed"),
        Err(e) => debug!(%first, "Tunnel copy ended: {}", e),
    }

    SessionEnd {
        first,
        result: result.map_err(|source| CopyError {
            direction: first,
            source,
        }),
    }
}
