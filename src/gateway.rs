//! The network-facing gateway.
//!
//! Every accepted connection gets its own task. The task reads the first
//! request head, asks the [`Router`] for a [`Mode`], and then either hands the
//! raw connection to the [`TunnelHandler`] or serves it with hyper through the
//! reverse proxy app, replaying the bytes already read.
//!
//! Proxied connections carry exactly one request (keep-alive is off), so a
//! client can never slip a tunnel request onto a connection that was
//! classified as proxy traffic.

use crate::conn::{read_head, write_error_response, ClientConn, Rewind};
use crate::error::{GatewayError, HeadError};
use crate::proxy::{self, ReverseProxyHandler};
use crate::router::{Mode, Router};
use crate::tunnel::TunnelHandler;
use axum::extract::ConnectInfo;
use bytes::BytesMut;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tower::Service;
use tracing::{debug, info, info_span, warn, Instrument};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Timeouts applied by the gateway itself.
#[derive(Debug, Clone, Copy)]
pub struct GatewayOptions {
    /// Time allowed to dial the sandbox.
    pub connect_timeout: Duration,
    /// Time allowed for a client to send its request head.
    pub header_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            header_timeout: Duration::from_secs(30),
        }
    }
}

/// A gateway bound to one sandbox through its [`Router`].
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    router: Router,
    tunnel: TunnelHandler,
    proxy_app: axum::Router,
    header_timeout: Duration,
}

impl Gateway {
    pub fn new(router: Router, options: GatewayOptions) -> Self {
        let endpoint = router.endpoint().clone();
        let tunnel = TunnelHandler::new(endpoint.clone(), options.connect_timeout);
        let proxy_app = proxy::app(ReverseProxyHandler::new(endpoint, options.connect_timeout));
        Self {
            inner: Arc::new(Inner {
                router,
                tunnel,
                proxy_app,
                header_timeout: options.header_timeout,
            }),
        }
    }

    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })
    }

    /// Accept connections forever.
    pub async fn serve(self, listener: TcpListener) {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already being handled keep running.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(
                "Gateway listening on {} -> sandbox {}",
                addr,
                self.inner.router.endpoint()
            );
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        tokio::spawn(
                            async move { gateway.handle_connection(stream, peer).await }
                                .instrument(info_span!("conn", %peer)),
                        );
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Gateway shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(self, mut stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut buf = BytesMut::new();

        let read = timeout(self.inner.header_timeout, read_head(&mut stream, &mut buf)).await;
        let (head, head_len) = match read.unwrap_or(Err(HeadError::Timeout)) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("Dropping connection: {}", err);
                if let Some(status) = err.status() {
                    let reason = status.canonical_reason().unwrap_or("Error");
                    let _ = write_error_response(&mut stream, status, reason).await;
                }
                return;
            }
        };

        let path = head.path();
        let mode = self.inner.router.classify(&path);
        info!(?mode, "{} {}", head.method, head.target);

        match mode {
            Mode::Tunnel => {
                let trailing = buf.split_off(head_len).freeze();
                let conn = ClientConn::new(stream, trailing);
                match self.inner.tunnel.handle(conn, &head).await {
                    Ok(end) => match end.result {
                        Ok(bytes) => {
                            debug!(first = %end.first, bytes, "Tunnel session ended")
                        }
                        Err(e) => debug!("Tunnel session ended: {}", e),
                    },
                    Err(e) => debug!("Tunnel setup failed: {}", e),
                }
            }
            Mode::Proxy => self.serve_proxied(stream, buf, peer).await,
        }
    }

    /// Serve one request with hyper, replaying the bytes already consumed.
    async fn serve_proxied(&self, stream: TcpStream, consumed: BytesMut, peer: SocketAddr) {
        let io = TokioIo::new(Rewind::new(consumed.freeze(), stream));
        let app = self.inner.proxy_app.clone();
        let service = service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ConnectInfo(peer));
            let mut app = app.clone();
            async move { app.call(req).await }
        });

        if let Err(e) = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(io, service)
            .await
        {
            debug!("Error serving proxied connection: {}", e);
        }
    }
}
