//! Reverse proxy for stateless request/response traffic.
//!
//! Each request is re-targeted at the sandbox with its path, query, method,
//! headers and body intact, and the sandbox response is streamed back as-is.
//! Hop-by-hop headers are dropped on both legs, `Host` is rewritten to the
//! sandbox and the client address is appended to `X-Forwarded-For`.
//! Backend failures become `502 Bad Gateway`. Nothing is retried.

use crate::sandbox::SandboxEndpoint;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::warn;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Clone)]
pub struct ReverseProxyHandler {
    endpoint: SandboxEndpoint,
    client: Client<HttpConnector, Body>,
}

impl ReverseProxyHandler {
    pub fn new(endpoint: SandboxEndpoint, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { endpoint, client }
    }

    /// The incoming URI with scheme and authority replaced by the sandbox's.
    pub fn target_uri(&self, uri: &Uri) -> Result<Uri, http::uri::InvalidUri> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.endpoint.base_url(), path_and_query).parse()
    }

    pub async fn handle(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        let (mut parts, body) = req.into_parts();

        let target = match self.target_uri(&parts.uri) {
            Ok(target) => target,
            Err(err) => {
                warn!(uri = %parts.uri, "Cannot build sandbox URI: {}", err);
                return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
            }
        };

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr.ip());
        }
        parts.uri = target.clone();
        parts.version = Version::HTTP_11;

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(err) => {
                warn!(%target, "Error contacting backend server: {}", err);
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
        }
    }
}

/// Axum app that proxies every path to the sandbox.
pub fn app(handler: ReverseProxyHandler) -> Router {
    Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn forward(
    State(proxy): State<ReverseProxyHandler>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    proxy
        .handle(req, connect_info.map(|ConnectInfo(addr)| addr))
        .await
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &nominated {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
