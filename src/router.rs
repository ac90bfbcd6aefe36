//! Path classification.
//!
//! Every request path maps to exactly one [`Mode`]. Rules are matched by
//! longest prefix; a path no rule covers is proxied.

use crate::error::ConfigError;
use crate::sandbox::SandboxEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kernel channel endpoints, e.g. `/api/kernels/<id>/channels`.
pub const KERNELS_PREFIX: &str = "/api/kernels/";
/// Terminal sessions, e.g. `/terminals/websocket/<name>`.
pub const TERMINALS_PREFIX: &str = "/terminals/websocket/";

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Seize the raw connection and splice it to the sandbox.
    Tunnel,
    /// Forward as a single request/response.
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(rename = "prefix")]
    pub path_prefix: String,
    pub mode: Mode,
}

impl RouteRule {
    pub fn new(path_prefix: impl Into<String>, mode: Mode) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            mode,
        }
    }

    pub fn tunnel(path_prefix: impl Into<String>) -> Self {
        Self::new(path_prefix, Mode::Tunnel)
    }

    pub fn proxy(path_prefix: impl Into<String>) -> Self {
        Self::new(path_prefix, Mode::Proxy)
    }
}

/// Interactive notebook session endpoints.
pub fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::tunnel(KERNELS_PREFIX),
        RouteRule::tunnel(TERMINALS_PREFIX),
    ]
}

/// Route table bound to the sandbox it routes to.
#[derive(Debug, Clone)]
pub struct Router {
    /// Sorted longest prefix first.
    rules: Vec<RouteRule>,
    endpoint: SandboxEndpoint,
}

impl Router {
    /// Build a router, rejecting prefixes without a leading `/` and prefixes
    /// bound to two different modes. Exact duplicates collapse into one rule.
    pub fn new(mut rules: Vec<RouteRule>, endpoint: SandboxEndpoint) -> Result<Self, ConfigError> {
        validate_rules(&rules)?;

        rules.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });
        rules.dedup();

        Ok(Self { rules, endpoint })
    }

    pub fn classify(&self, path: &str) -> Mode {
        self.rules
            .iter()
            .find(|rule| path.starts_with(rule.path_prefix.as_str()))
            .map(|rule| rule.mode)
            .unwrap_or(Mode::Proxy)
    }

    pub fn endpoint(&self) -> &SandboxEndpoint {
        &self.endpoint
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

/// Check that every prefix is rooted and bound to a single mode.
pub fn validate_rules(rules: &[RouteRule]) -> Result<(), ConfigError> {
    let mut seen: HashMap<&str, Mode> = HashMap::new();
    for rule in rules {
        if !rule.path_prefix.starts_with('/') {
            return Err(ConfigError::InvalidPrefix(rule.path_prefix.clone()));
        }
        match seen.insert(&rule.path_prefix, rule.mode) {
            Some(mode) if mode != rule.mode => {
                return Err(ConfigError::ConflictingRule(rule.path_prefix.clone()));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SandboxEndpoint {
        SandboxEndpoint::new("127.0.0.1", "8888")
    }

    fn default_router() -> Router {
        Router::new(default_rules(), endpoint()).unwrap()
    }

    #[test]
    fn test_interactive_paths_tunnel() {
        let router = default_router();
        assert_eq!(router.classify("/api/kernels/abc/channels"), Mode::Tunnel);
        assert_eq!(router.classify("/terminals/websocket/1"), Mode::Tunnel);
    }

    #[test]
    fn test_other_paths_proxy() {
        let router = default_router();
        assert_eq!(router.classify("/status"), Mode::Proxy);
        assert_eq!(router.classify("/"), Mode::Proxy);
        assert_eq!(router.classify("/api/contents/notebook.ipynb"), Mode::Proxy);
        // Prefix includes the trailing slash, so the bare collection is proxied.
        assert_eq!(router.classify("/api/kernels"), Mode::Proxy);
    }

    #[test]
    fn test_empty_and_odd_paths_default_to_proxy() {
        let router = default_router();
        assert_eq!(router.classify(""), Mode::Proxy);
        assert_eq!(router.classify("*"), Mode::Proxy);
        assert_eq!(router.classify("api/kernels/abc"), Mode::Proxy);
    }

    #[test]
    fn test_longest_prefix_wins_over_order() {
        let router = Router::new(
            vec![
                RouteRule::tunnel("/api/"),
                RouteRule::proxy("/api/kernels/specs/"),
                RouteRule::tunnel("/api/kernels/"),
            ],
            endpoint(),
        )
        .unwrap();

        assert_eq!(router.classify("/api/kernels/specs/python3"), Mode::Proxy);
        assert_eq!(router.classify("/api/kernels/abc/channels"), Mode::Tunnel);
        assert_eq!(router.classify("/api/sessions"), Mode::Tunnel);
        assert_eq!(router.classify("/lab"), Mode::Proxy);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let router = default_router();
        for path in ["/api/kernels/x", "/tree", "", "/terminals/websocket/"] {
            let first = router.classify(path);
            for _ in 0..10 {
                assert_eq!(router.classify(path), first);
            }
        }
    }

    #[test]
    fn test_rejects_prefix_without_slash() {
        let err = Router::new(vec![RouteRule::tunnel("api/kernels/")], endpoint()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPrefix(p) if p == "api/kernels/"));
    }

    #[test]
    fn test_rejects_conflicting_modes() {
        let err = Router::new(
            vec![RouteRule::tunnel("/ws/"), RouteRule::proxy("/ws/")],
            endpoint(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingRule(_)));
    }

    #[test]
    fn test_duplicate_rules_collapse() {
        let router = Router::new(
            vec![RouteRule::tunnel("/ws/"), RouteRule::tunnel("/ws/")],
            endpoint(),
        )
        .unwrap();
        assert_eq!(router.rules().len(), 1);
    }
}
