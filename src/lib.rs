//! Notebook gateway: one listening port in front of a notebook sandbox.
//!
//! Interactive session paths are tunneled as raw byte streams to the sandbox;
//! everything else goes through a reverse proxy.

pub mod config;
pub mod conn;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod router;
pub mod sandbox;
pub mod tunnel;

pub use config::GatewayConfig;
pub use error::Error;
pub use gateway::{Gateway, GatewayOptions};
pub use router::{Mode, RouteRule, Router};
pub use sandbox::{provision, Mount, Runtime, Sandbox, SandboxEndpoint};
