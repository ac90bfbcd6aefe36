//! The gateway's own slice of HTTP/1.1: reading the first request head off a
//! raw connection, answering with a bare error response, and handing the raw
//! transport over to whoever needs it.

use crate::error::{HeadError, HijackUnsupportedError};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound on the size of a request head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 4096;

/// A parsed HTTP/1.x request line plus headers, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent (origin-form or absolute-form).
    pub target: String,
    /// Minor version: `1` for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Path component of the target, without query.
    pub fn path(&self) -> Cow<'_, str> {
        if self.target.starts_with('/') {
            let end = self.target.find('?').unwrap_or(self.target.len());
            return Cow::Borrowed(&self.target[..end]);
        }
        match self.target.parse::<http::Uri>() {
            Ok(uri) if uri.scheme().is_some() => Cow::Owned(uri.path().to_string()),
            _ => Cow::Borrowed(""),
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Serialize back onto the wire.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(self.method.as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(self.target.as_bytes());
        dst.extend_from_slice(b" HTTP/1.");
        dst.extend_from_slice(self.version.to_string().as_bytes());
        dst.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            dst.extend_from_slice(name.as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value);
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
    }
}

/// Try to parse a request head from the start of `buf`.
///
/// Returns the head and its length in bytes, or `None` if more input is needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(HeadError::TooLarge {
                limit: MAX_HEAD_BYTES,
            })
        }
        Err(err) => return Err(HeadError::Malformed(err)),
    };

    let head = RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };
    Ok(Some((head, len)))
}

/// Read from `io` into `buf` until a full request head is available.
///
/// Everything read stays in `buf`, including bytes past the head.
pub async fn read_head<S>(io: &mut S, buf: &mut BytesMut) -> Result<(RequestHead, usize), HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(parsed) = parse_head(buf)? {
            return Ok(parsed);
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(HeadError::TooLarge {
                limit: MAX_HEAD_BYTES,
            });
        }

        buf.reserve(READ_CHUNK);
        if io.read_buf(buf).await? == 0 {
            return Err(if buf.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Incomplete
            });
        }
    }
}

/// Write a minimal `text/plain` response and close the write side.
pub async fn write_error_response<W>(io: &mut W, status: StatusCode, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", message);
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len()
    );
    io.write_all(head.as_bytes()).await?;
    io.write_all(body.as_bytes()).await?;
    io.flush().await?;
    io.shutdown().await
}

/// Raw transport taken away from the HTTP layer.
pub struct Hijacked<S> {
    pub io: S,
    /// Bytes the HTTP layer had already read past the request head.
    pub buffered: Bytes,
}

/// Capability of an HTTP layer to give up a connection mid-request.
///
/// Until [`hijack`](Self::hijack) succeeds the HTTP layer still owns the
/// connection and can answer with an ordinary error response.
#[async_trait]
pub trait RawConnectionAccess: Send {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Take exclusive ownership of the transport.
    fn hijack(&mut self) -> Result<Hijacked<Self::Io>, HijackUnsupportedError>;

    /// Answer with an error and let the HTTP layer close the connection.
    async fn respond_error(&mut self, status: StatusCode, message: &str) -> io::Result<()>;
}

/// A client connection whose request head the gateway has already read.
pub struct ClientConn<S> {
    io: Option<S>,
    buffered: Bytes,
}

impl<S> ClientConn<S> {
    pub fn new(io: S, buffered: Bytes) -> Self {
        Self {
            io: Some(io),
            buffered,
        }
    }

    pub fn is_hijacked(&self) -> bool {
        self.io.is_none()
    }
}

#[async_trait]
impl<S> RawConnectionAccess for ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = S;

    fn hijack(&mut self) -> Result<Hijacked<S>, HijackUnsupportedError> {
        let io = self.io.take().ok_or(HijackUnsupportedError)?;
        Ok(Hijacked {
            io,
            buffered: std::mem::take(&mut self.buffered),
        })
    }

    async fn respond_error(&mut self, status: StatusCode, message: &str) -> io::Result<()> {
        let io = self.io.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection already hijacked")
        })?;
        write_error_response(io, status, message).await
    }
}

/// Replays already-consumed bytes before reading from the inner stream.
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
