//! Gateway configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object is a valid config. Command-line flags are applied on top.

use crate::error::ConfigError;
use crate::gateway::GatewayOptions;
use crate::router::{default_rules, RouteRule};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Where the host folder shows up inside the sandbox.
pub const DEFAULT_MOUNT_TARGET: &str = "/notebooks";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub routes: Vec<RouteRule>,
    pub connect_timeout_ms: u64,
    pub header_timeout_ms: u64,
    pub mount_target: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            routes: default_rules(),
            connect_timeout_ms: 10_000,
            header_timeout_ms: 30_000,
            mount_target: DEFAULT_MOUNT_TARGET.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_ms"));
        }
        if self.header_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("header_timeout_ms"));
        }
        Ok(())
    }

    /// Replace the route list when any prefixes were given explicitly.
    pub fn override_routes(&mut self, tunnel: &[String], proxy: &[String]) {
        if tunnel.is_empty() && proxy.is_empty() {
            return;
        }
        self.routes = tunnel
            .iter()
            .map(RouteRule::tunnel)
            .chain(proxy.iter().map(RouteRule::proxy))
            .collect();
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            header_timeout: Duration::from_millis(self.header_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Mode, KERNELS_PREFIX, TERMINALS_PREFIX};
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "notebook-gateway-{}-{}.json",
            name,
            uuid::Uuid::new_v4()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.listen.port(), 3000);
        assert_eq!(
            config.routes,
            vec![
                RouteRule::tunnel(KERNELS_PREFIX),
                RouteRule::tunnel(TERMINALS_PREFIX)
            ]
        );
    }

    #[test]
    fn test_load_routes_and_timeouts() {
        let path = write_temp(
            "routes",
            r#"{
                "listen": "127.0.0.1:8080",
                "routes": [
                    {"prefix": "/api/kernels/", "mode": "tunnel"},
                    {"prefix": "/api/kernels/specs/", "mode": "proxy"}
                ],
                "connect_timeout_ms": 250
            }"#,
        );
        let config = GatewayConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.routes[1].mode, Mode::Proxy);
        assert_eq!(
            config.gateway_options().connect_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.header_timeout_ms, 30_000);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let path = write_temp("unknown", r#"{"listen_port": 3000}"#);
        let err = GatewayConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        for (field, body) in [
            ("connect_timeout_ms", r#"{"connect_timeout_ms": 0}"#),
            ("header_timeout_ms", r#"{"header_timeout_ms": 0}"#),
        ] {
            let path = write_temp("zero", body);
            let err = GatewayConfig::load(&path).unwrap_err();
            std::fs::remove_file(&path).unwrap();
            assert!(matches!(err, ConfigError::ZeroTimeout(name) if name == field));
        }
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = GatewayConfig::load(Path::new("/nonexistent/gateway.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_cli_prefixes_replace_routes() {
        let mut config = GatewayConfig::default();
        config.override_routes(&[], &[]);
        assert_eq!(config.routes, default_rules());

        config.override_routes(&["/ws/".to_string()], &["/ws/static/".to_string()]);
        assert_eq!(
            config.routes,
            vec![RouteRule::tunnel("/ws/"), RouteRule::proxy("/ws/static/")]
        );
    }
}
