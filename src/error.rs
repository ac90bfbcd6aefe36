//! Error types for provisioning and for per-connection gateway failures.
//!
//! Provisioning and bind errors are fatal and end the process. Everything
//! else is scoped to a single connection: it is reported to the client when
//! an HTTP response is still possible, otherwise the connection is dropped.

use crate::tunnel::Direction;
use http::StatusCode;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// The sandbox could not be created, started or inspected.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Could not reach the container runtime at all.
    #[error("failed to connect to container runtime: {0}")]
    Connect(String),

    /// The host directory to mount is missing or unreadable.
    #[error("mount source '{path}' is not usable: {source}")]
    MountSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create container from image '{image}': {message}")]
    Create { image: String, message: String },

    #[error("failed to start container {id}: {message}")]
    Start { id: String, message: String },

    #[error("failed to inspect container {id}: {message}")]
    Inspect { id: String, message: String },

    /// The container is running but has no network address we can dial.
    #[error("container {id} has no network address")]
    NoAddress { id: String },

    /// The container does not expose any TCP port.
    #[error("container {id} exposes no TCP port")]
    NoPort { id: String },

    #[error("failed to remove container {id}: {message}")]
    Remove { id: String, message: String },
}

/// Opening a transport connection to the sandbox failed.
#[derive(Debug, Error)]
#[error("failed to dial sandbox at {addr}: {source}")]
pub struct DialError {
    pub addr: String,
    #[source]
    pub source: io::Error,
}

/// The HTTP layer serving this connection cannot hand over the raw transport.
#[derive(Debug, Error)]
#[error("connection does not support raw transport access")]
pub struct HijackUnsupportedError;

/// Writing the re-serialized request onto the sandbox connection failed.
#[derive(Debug, Error)]
#[error("failed to forward request to sandbox: {0}")]
pub struct ForwardError(#[from] pub io::Error);

/// One copy direction of an established tunnel failed.
///
/// This is an ordinary way for a session to end (peer reset, broken pipe).
#[derive(Debug, Error)]
#[error("{direction} copy failed: {source}")]
pub struct CopyError {
    pub direction: Direction,
    #[source]
    pub source: io::Error,
}

/// Tunnel setup failures. Each one ends the session before any splice starts.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    HijackUnsupported(#[from] HijackUnsupportedError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// The initial request head could not be read from a client connection.
#[derive(Debug, Error)]
pub enum HeadError {
    /// Peer closed the connection before sending a single byte.
    #[error("connection closed before a request was sent")]
    Closed,

    /// Peer closed the connection in the middle of the request head.
    #[error("connection closed in the middle of the request head")]
    Incomplete,

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request head exceeds {limit} bytes or too many headers")]
    TooLarge { limit: usize },

    #[error("timed out waiting for the request head")]
    Timeout,

    #[error("I/O error reading request head: {0}")]
    Io(#[from] io::Error),
}

impl HeadError {
    /// The status to answer with, or `None` if no response should be attempted.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HeadError::Malformed(_) => Some(StatusCode::BAD_REQUEST),
            HeadError::TooLarge { .. } => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            HeadError::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
            HeadError::Closed | HeadError::Incomplete | HeadError::Io(_) => None,
        }
    }
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("route prefix '{0}' must start with '/'")]
    InvalidPrefix(String),

    #[error("route prefix '{0}' is bound to more than one mode")]
    ConflictingRule(String),

    #[error("'{0}' must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// The gateway could not start listening.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Top-level error for the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_error_display() {
        let err = DialError {
            addr: "172.17.0.2:8888".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("172.17.0.2:8888"));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_head_error_status() {
        assert_eq!(HeadError::Timeout.status(), Some(StatusCode::REQUEST_TIMEOUT));
        assert_eq!(
            HeadError::TooLarge { limit: 10 }.status(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
        assert_eq!(
            HeadError::Malformed(httparse::Error::Token).status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert!(HeadError::Closed.status().is_none());
    }

    #[test]
    fn test_tunnel_error_from_forward() {
        let err: TunnelError =
            ForwardError(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).into();
        assert!(matches!(err, TunnelError::Forward(_)));
        assert!(err.to_string().contains("forward"));
    }
}
