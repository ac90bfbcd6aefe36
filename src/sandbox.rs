//! Sandbox provisioning interface.
//!
//! The gateway does not care how the sandbox is run. It only needs a
//! [`Runtime`] that can create, start and inspect a container, and it keeps
//! the resulting [`SandboxEndpoint`] for the rest of the process lifetime.

use crate::error::ProvisionError;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

/// Network address of the running sandbox. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoint {
    host: String,
    port: String,
}

impl SandboxEndpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL for plain HTTP requests to the sandbox.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for SandboxEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A host directory bind-mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// A provisioned, running sandbox.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub endpoint: SandboxEndpoint,
}

/// Container runtime able to host the sandbox.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create a container from `image` with the given mounts, returning its id.
    async fn create(&self, image: &str, mounts: &[Mount]) -> Result<String, ProvisionError>;

    async fn start(&self, id: &str) -> Result<(), ProvisionError>;

    /// Resolve the address the sandbox is listening on.
    async fn inspect(&self, id: &str) -> Result<SandboxEndpoint, ProvisionError>;

    /// Stop and delete the container.
    async fn remove(&self, id: &str) -> Result<(), ProvisionError>;
}

/// Create, start and inspect a sandbox.
///
/// A container that was created but could not be started or inspected is
/// removed again before the error is returned.
pub async fn provision<R>(
    runtime: &R,
    image: &str,
    mounts: &[Mount],
) -> Result<Sandbox, ProvisionError>
where
    R: Runtime + ?Sized,
{
    let id = runtime.create(image, mounts).await?;
    info!(container = %id, image, "Created sandbox container");

    let endpoint = match start_and_inspect(runtime, &id).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            if let Err(cleanup) = runtime.remove(&id).await {
                warn!(container = %id, "Failed to remove container after error: {}", cleanup);
            }
            return Err(err);
        }
    };

    info!(container = %id, %endpoint, "Sandbox is running");
    Ok(Sandbox { id, endpoint })
}

async fn start_and_inspect<R>(runtime: &R, id: &str) -> Result<SandboxEndpoint, ProvisionError>
where
    R: Runtime + ?Sized,
{
    runtime.start(id).await?;
    runtime.inspect(id).await
}
