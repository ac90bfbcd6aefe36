//! Docker-backed [`Runtime`] built on bollard.

use crate::error::ProvisionError;
use crate::sandbox::{Mount, Runtime, SandboxEndpoint};
use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig, NetworkSettings},
    query_parameters::{
        CreateContainerOptionsBuilder, InspectContainerOptions, RemoveContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder,
    },
    Docker, API_DEFAULT_VERSION,
};
use std::path::Path;
use tracing::debug;

const DOCKER_TIMEOUT_SECS: u64 = 120;
const STOP_GRACE_SECS: i32 = 5;
const CONTAINER_NAME_PREFIX: &str = "notebook-gateway";

/// Runs the sandbox as a local Docker container.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect_local() -> Result<Self, ProvisionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProvisionError::Connect(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Connect to an explicit unix socket, e.g. `/var/run/docker.sock`.
    pub fn connect_socket(path: &Path) -> Result<Self, ProvisionError> {
        let docker = Docker::connect_with_socket(
            &path.to_string_lossy(),
            DOCKER_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| ProvisionError::Connect(format!("{}: {}", path.display(), e)))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create(&self, image: &str, mounts: &[Mount]) -> Result<String, ProvisionError> {
        let name = format!("{}-{}", CONTAINER_NAME_PREFIX, uuid::Uuid::new_v4().simple());
        let binds = mounts.iter().map(bind_spec).collect();

        let config = ContainerCreateBody {
            image: Some(image.to_string()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                config,
            )
            .await
            .map_err(|e| ProvisionError::Create {
                image: image.to_string(),
                message: e.to_string(),
            })?;

        for warning in &created.warnings {
            debug!(container = %created.id, "Docker warning: {}", warning);
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), ProvisionError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| ProvisionError::Start {
                id: id.to_string(),
                message: e.to_string(),
            })
    }

    async fn inspect(&self, id: &str) -> Result<SandboxEndpoint, ProvisionError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| ProvisionError::Inspect {
                id: id.to_string(),
                message: e.to_string(),
            })?;

        let settings = details
            .network_settings
            .ok_or_else(|| ProvisionError::NoAddress { id: id.to_string() })?;
        endpoint_from_settings(id, &settings)
    }

    async fn remove(&self, id: &str) -> Result<(), ProvisionError> {
        let _ = self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await;

        match self
            .docker
            .remove_container(id, Some(RemoveContainerOptionsBuilder::new().force(true).build()))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(ProvisionError::Remove {
                id: id.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

fn bind_spec(mount: &Mount) -> String {
    let mut spec = format!("{}:{}", mount.source.display(), mount.destination);
    if mount.read_only {
        spec.push_str(":ro");
    }
    spec
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

/// Pick the sandbox address out of the container's network settings.
///
/// The address comes from the `bridge` network if present, otherwise from
/// the alphabetically first network with an IP. The port is the lowest
/// exposed TCP port.
pub(crate) fn endpoint_from_settings(
    id: &str,
    settings: &NetworkSettings,
) -> Result<SandboxEndpoint, ProvisionError> {
    let mut networks: Vec<_> = settings
        .networks
        .iter()
        .flatten()
        .filter_map(|(name, endpoint)| {
            endpoint
                .ip_address
                .as_deref()
                .filter(|ip| !ip.is_empty())
                .map(|ip| (name.as_str(), ip))
        })
        .collect();
    networks.sort_by_key(|(name, _)| (*name != "bridge", *name));

    let host = networks
        .first()
        .map(|(_, ip)| ip.to_string())
        .ok_or_else(|| ProvisionError::NoAddress { id: id.to_string() })?;

    let port = settings
        .ports
        .iter()
        .flatten()
        .filter_map(|(key, _)| key.strip_suffix("/tcp"))
        .filter_map(|port| port.parse::<u16>().ok())
        .min()
        .ok_or_else(|| ProvisionError::NoPort { id: id.to_string() })?;

    Ok(SandboxEndpoint::new(host, port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EndpointSettings;
    use std::collections::HashMap;

    fn settings(networks: &[(&str, &str)], ports: &[&str]) -> NetworkSettings {
        let networks = networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.to_string(),
                    EndpointSettings {
                        ip_address: Some(ip.to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        let ports = ports
            .iter()
            .map(|key| (key.to_string(), None))
            .collect::<HashMap<_, _>>();
        NetworkSettings {
            networks: Some(networks),
            ports: Some(ports),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_prefers_bridge_and_lowest_tcp_port() {
        let settings = settings(
            &[("custom", "10.0.0.5"), ("bridge", "172.17.0.2")],
            &["9999/tcp", "8888/tcp", "53/udp"],
        );
        let endpoint = endpoint_from_settings("abc", &settings).unwrap();
        assert_eq!(endpoint, SandboxEndpoint::new("172.17.0.2", "8888"));
    }

    #[test]
    fn test_endpoint_falls_back_to_first_named_network() {
        let settings = settings(&[("zeta", "10.0.1.2"), ("alpha", "10.0.0.2")], &["80/tcp"]);
        let endpoint = endpoint_from_settings("abc", &settings).unwrap();
        assert_eq!(endpoint.host(), "10.0.0.2");
    }

    #[test]
    fn test_endpoint_requires_address_and_port() {
        let no_ip = settings(&[("bridge", "")], &["8888/tcp"]);
        assert!(matches!(
            endpoint_from_settings("abc", &no_ip),
            Err(ProvisionError::NoAddress { .. })
        ));

        let udp_only = settings(&[("bridge", "172.17.0.2")], &["53/udp"]);
        assert!(matches!(
            endpoint_from_settings("abc", &udp_only),
            Err(ProvisionError::NoPort { .. })
        ));
    }

    #[test]
    fn test_bind_spec() {
        let mount = Mount::new("/home/me/nb", "/notebooks");
        assert_eq!(bind_spec(&mount), "/home/me/nb:/notebooks");
        let mount = mount.read_only(true);
        assert_eq!(bind_spec(&mount), "/home/me/nb:/notebooks:ro");
    }
}
