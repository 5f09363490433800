//! Container runtime adapter: interface plus a `bollard`-backed Docker
//! implementation.
//!
//! Grounded on `sx9-foundation-core::docker_tool` for the bollard
//! create/start idiom and on the `sentiric-orchestrator` reference file for
//! the inspect → recreate and stats-snapshot workflows.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use fleetd_metrics::{BlockIoEntry, CpuStats, CpuUsage, MemoryStats, NetworkInterfaceStats, RawStats};
use futures_util::StreamExt;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("no stats available for '{0}'")]
    NoStats(String),
}

#[derive(Debug, Clone)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct InspectInfo {
    pub image: String,
    pub env: Vec<String>,
    pub networks: Vec<String>,
}

/// Create / start / stop / remove / inspect / stats operations over running
/// containers. Thread-safe per-operation; compound workflows (e.g. inspect
/// then run under a new name) are the caller's responsibility to serialize
/// (§5 "Shared resources").
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError>;
    async fn get(&self, name: &str) -> Result<Option<ContainerHandle>, RuntimeError>;
    async fn inspect(&self, name: &str) -> Result<InspectInfo, RuntimeError>;
    async fn stats_snapshot(&self, name: &str) -> Result<RawStats, RuntimeError>;
    async fn run(
        &self,
        image: &str,
        name: &str,
        env: &[String],
        network: &str,
        ports: &[PortMapping],
    ) -> Result<String, RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
    async fn ping(&self) -> Result<(), RuntimeError>;
    async fn get_network(&self, name: &str) -> Result<Vec<String>, RuntimeError>;
    async fn self_hostname_container_networks(&self) -> Result<Vec<String>, RuntimeError>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket_defaults()?;
        Ok(Self { docker })
    }

    fn strip_leading_slash(name: &str) -> String {
        name.strip_prefix('/').unwrap_or(name).to_string()
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| Self::strip_leading_slash(&n))
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<ContainerHandle>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().find_map(|c| {
            let found_name = c.names.as_ref()?.iter().find_map(|n| {
                let stripped = Self::strip_leading_slash(n);
                (stripped == name).then_some(stripped)
            })?;
            Some(ContainerHandle {
                id: c.id.unwrap_or_default(),
                name: found_name,
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
        }))
    }

    async fn inspect(&self, name: &str) -> Result<InspectInfo, RuntimeError> {
        let inspect = self.docker.inspect_container(name, None).await?;
        let image = inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let env = inspect.config.as_ref().and_then(|c| c.env.clone()).unwrap_or_default();
        let networks = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.clone())
            .map(|n| n.into_keys().collect())
            .unwrap_or_default();
        Ok(InspectInfo { image, env, networks })
    }

    async fn stats_snapshot(&self, name: &str) -> Result<RawStats, RuntimeError> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::NoStats(name.to_string()))??;

        let to_cpu_stats = |s: &bollard::container::CPUStats| CpuStats {
            cpu_usage: CpuUsage {
                total_usage: s.cpu_usage.total_usage,
                percpu_usage: s.cpu_usage.percpu_usage.clone().unwrap_or_default(),
            },
            system_cpu_usage: s.system_cpu_usage.unwrap_or(0),
            online_cpus: s.online_cpus.map(|n| n as u32),
        };

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(0);

        let networks = stats
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    NetworkInterfaceStats {
                        rx_bytes: v.rx_bytes,
                        tx_bytes: v.tx_bytes,
                    },
                )
            })
            .collect();

        let blkio_service_bytes = stats
            .blkio_stats
            .io_service_bytes_recursive
            .unwrap_or_default()
            .into_iter()
            .map(|entry| BlockIoEntry {
                op: entry.op,
                value: entry.value,
            })
            .collect();

        Ok(RawStats {
            cpu_stats: to_cpu_stats(&stats.cpu_stats),
            precpu_stats: to_cpu_stats(&stats.precpu_stats),
            memory_stats: MemoryStats {
                usage: memory_usage,
                limit: memory_limit,
            },
            networks,
            blkio_service_bytes,
        })
    }

    async fn run(
        &self,
        image: &str,
        name: &str,
        env: &[String],
        network: &str,
        ports: &[PortMapping],
    ) -> Result<String, RuntimeError> {
        let mut pull_stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull_stream.next().await {
            if let Err(e) = progress {
                warn!(image, error = %e, "image pull reported an error, continuing with local copy if present");
            }
        }

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        for mapping in ports {
            let key = format!("{}/tcp", mapping.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let mut endpoints_config = HashMap::new();
        endpoints_config.insert(network.to_string(), EndpointSettings::default());

        let config = ContainerConfig {
            image: Some(image.to_string()),
            env: Some(env.to_vec()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;

        info!(container = name, image, "container created and started");
        Ok(response.id)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn get_network(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self.inspect(name).await?.networks)
    }

    async fn self_hostname_container_networks(&self) -> Result<Vec<String>, RuntimeError> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_default();
        if hostname.is_empty() {
            return Ok(Vec::new());
        }
        self.get_network(&hostname).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_leading_slash_handles_both_forms() {
        assert_eq!(DockerRuntime::strip_leading_slash("/worker1"), "worker1");
        assert_eq!(DockerRuntime::strip_leading_slash("worker1"), "worker1");
    }
}
