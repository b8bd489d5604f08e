use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;
use berth_core::{
    runtime::{
        network_name, project_labels, BuildRequest, ContainerRuntime, InstanceHandle, InstanceInfo, LaunchSpec,
        RuntimeMount, VolumeInfo, VolumeSpec, LABEL_PROJECT, LABEL_SERVICE, LABEL_VOLUME,
    },
    topology::{PortBinding, ProbeCheck, Protocol, ServiceName},
};
use berth_error::{generic_error, ErrorContext as _, GenericError};
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions, NetworkingConfig,
        RemoveContainerOptions, StopContainerOptions,
    },
    errors::Error,
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    models::{ContainerSummary, EndpointSettings, HostConfig, PortTypeEnum},
    network::CreateNetworkOptions,
    volume::{CreateVolumeOptions, ListVolumesOptions},
    Docker,
};
use futures::StreamExt as _;
use indexmap::IndexMap;
use tokio::{
    io::{AsyncWriteExt as _, BufWriter},
    net::TcpStream,
};
use tracing::{debug, error, trace};

/// Number of trailing build output lines kept for error reporting.
const BUILD_OUTPUT_TAIL: usize = 20;

/// A [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    network_driver: String,
    log_dir: Option<PathBuf>,
}

impl DockerRuntime {
    /// Connects to the Docker daemon, using the default connection settings for the platform.
    ///
    /// # Errors
    ///
    /// If the Docker client cannot be created/configured, an error will be returned.
    pub fn connect(network_driver: String) -> Result<Self, GenericError> {
        let docker = Docker::connect_with_defaults().error_context("Failed to connect to the Docker daemon.")?;

        Ok(Self {
            docker,
            network_driver,
            log_dir: None,
        })
    }

    /// Configures the runtime to capture instance logs.
    ///
    /// Logs are stored in the given directory, under a subdirectory named after the project, following the pattern of
    /// `<service>.[stdout|stderr].log`.
    pub fn with_logging(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    async fn pull_image_if_missing(&self, image: &str) -> Result<(), GenericError> {
        if self.image_exists(image).await? {
            return Ok(());
        }

        debug!(image, "Pulling image...");

        let (from_image, tag) = split_image_reference(image);
        let image_options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut create_stream = self.docker.create_image(Some(image_options), None, None);
        while let Some(info) = create_stream.next().await {
            let info = info.with_error_context(|| format!("Failed to pull image '{}'.", image))?;
            trace!(image, "Received image pull update: {:?}", info);
        }

        debug!(image, "Pulled image.");
        Ok(())
    }

    async fn remove_existing_container(&self, container_name: &str) -> Result<(), GenericError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_name, Some(options)).await {
            Ok(()) => {
                debug!("Removed stale container '{}'.", container_name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn capture_container_logs(
        &self, container_log_dir: PathBuf, log_name: &str, container_name: &str,
    ) -> Result<(), GenericError> {
        // Create the files up front so that permission issues surface before the capture task is spawned.
        tokio::fs::create_dir_all(&container_log_dir)
            .await
            .error_context("Failed to create logs directory. Possible permissions issue.")?;

        let stdout_log_path = container_log_dir.join(format!("{}.stdout.log", log_name));
        let stderr_log_path = container_log_dir.join(format!("{}.stderr.log", log_name));

        let mut stdout_file = tokio::fs::File::create(&stdout_log_path)
            .await
            .map(BufWriter::new)
            .error_context("Failed to create standard output log file. Possible permissions issue.")?;
        let mut stderr_file = tokio::fs::File::create(&stderr_log_path)
            .await
            .map(BufWriter::new)
            .error_context("Failed to create standard error log file. Possible permissions issue.")?;

        let logs_config = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut log_stream = self.docker.logs::<String>(container_name, Some(logs_config));
        let container_name = container_name.to_string();

        tokio::spawn(async move {
            while let Some(log_result) = log_stream.next().await {
                let written = match log_result {
                    Ok(LogOutput::StdOut { message }) => write_log(&mut stdout_file, &message).await,
                    Ok(LogOutput::StdErr { message }) => write_log(&mut stderr_file, &message).await,
                    Ok(LogOutput::StdIn { .. } | LogOutput::Console { .. }) => Ok(()),
                    Err(e) => {
                        error!(error = %e, "Failed to read log line from container '{}'.", container_name);
                        break;
                    }
                };

                if let Err(e) = written {
                    error!(error = %e, "Failed to write log line of container '{}'.", container_name);
                    break;
                }
            }

            if let Err(e) = stdout_file.get_mut().sync_all().await {
                error!(error = %e, "Failed to fsync standard output log file.");
            }
            if let Err(e) = stderr_file.get_mut().sync_all().await {
                error!(error = %e, "Failed to fsync standard error log file.");
            }
        });

        Ok(())
    }

    async fn exec_probe(&self, instance: &InstanceHandle, command: &[String]) -> Result<(), GenericError> {
        let exec_options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(&instance.name, exec_options).await?;

        let mut output_tail = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while let Some(chunk) = output.next().await {
                let chunk = chunk?;
                push_tail(&mut output_tail, chunk.to_string(), 5);
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        match inspected.exit_code {
            Some(0) => Ok(()),
            Some(code) => Err(generic_error!(
                "`{}` exited with code {}: {}",
                command.join(" "),
                code,
                output_tail.join("").trim()
            )),
            None => Err(generic_error!("`{}` did not complete.", command.join(" "))),
        }
    }

    async fn tcp_probe(&self, instance: &InstanceHandle, port: u16) -> Result<(), GenericError> {
        // The host side of a published port is held open by the userland proxy before anything listens behind it, so
        // connect to the container port on the instance's own network address instead.
        let inspected = self.docker.inspect_container(&instance.name, None).await?;
        let networks = inspected
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        let ip = network_address(&networks)
            .ok_or_else(|| generic_error!("Container '{}' has no network address.", instance.name))?;
        let address = SocketAddr::new(ip, port);

        TcpStream::connect(address)
            .await
            .with_error_context(|| format!("Failed to connect to {}.", address))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, project: &str) -> Result<(), GenericError> {
        let network_name = network_name(project);

        let networks = self.docker.list_networks::<String>(None).await?;
        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(network_name.as_str()))
        {
            debug!(project, "Network '{}' already exists.", network_name);
            return Ok(());
        }

        let network_options = CreateNetworkOptions {
            name: network_name.clone(),
            check_duplicate: true,
            driver: self.network_driver.clone(),
            labels: to_hash_map(&project_labels(project)),
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(network_options)
            .await
            .with_error_context(|| format!("Failed to create network '{}'.", network_name))?;
        debug!(project, "Created network '{}' (ID: {:?}).", network_name, response.id);

        Ok(())
    }

    async fn remove_network(&self, project: &str) -> Result<(), GenericError> {
        let network_name = network_name(project);
        match self.docker.remove_network(&network_name).await {
            Ok(()) => {
                debug!(project, "Removed network '{}'.", network_name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>, GenericError> {
        match self.docker.inspect_volume(name).await {
            Ok(volume) => Ok(Some(VolumeInfo {
                volume: volume.labels.get(LABEL_VOLUME).cloned(),
                name: volume.name,
                driver: volume.driver,
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), GenericError> {
        let volume_options = CreateVolumeOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            labels: to_hash_map(&spec.labels),
            ..Default::default()
        };
        self.docker
            .create_volume(volume_options)
            .await
            .with_error_context(|| format!("Failed to create volume '{}'.", spec.name))?;
        Ok(())
    }

    async fn list_volumes(&self, project: &str) -> Result<Vec<VolumeInfo>, GenericError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", LABEL_PROJECT, project)]);

        let response = self.docker.list_volumes(Some(ListVolumesOptions { filters })).await?;
        let mut volumes = response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| VolumeInfo {
                volume: volume.labels.get(LABEL_VOLUME).cloned(),
                name: volume.name,
                driver: volume.driver,
            })
            .collect::<Vec<_>>();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(volumes)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), GenericError> {
        self.docker
            .remove_volume(name, None)
            .await
            .with_error_context(|| format!("Failed to remove volume '{}'.", name))
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, GenericError> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<(), GenericError> {
        let build_options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.tag.clone(),
            rm: true,
            forcerm: true,
            labels: to_hash_map(&request.labels),
            ..Default::default()
        };

        let mut output_tail = Vec::new();
        let context = bytes::Bytes::from(request.context.clone());
        let mut build_stream = self.docker.build_image(build_options, None, Some(context));
        while let Some(info) = build_stream.next().await {
            let info = match info {
                Ok(info) => info,
                Err(e) => return Err(build_failure(&request.tag, &e.to_string(), &output_tail)),
            };

            if let Some(line) = info.stream {
                trace!(tag = %request.tag, "{}", line.trim_end());
                push_tail(&mut output_tail, line, BUILD_OUTPUT_TAIL);
            }
            if let Some(error) = info.error {
                return Err(build_failure(&request.tag, &error, &output_tail));
            }
        }

        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<InstanceHandle, GenericError> {
        self.pull_image_if_missing(&spec.image).await?;
        self.remove_existing_container(&spec.instance_name).await?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for binding in &spec.ports {
            let key = format!("{}/{}", binding.container_port, binding.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(bollard::models::PortBinding {
                    host_ip: binding.host_ip.map(|ip| ip.to_string()),
                    host_port: Some(binding.host_port.to_string()),
                });
        }

        let binds = spec.mounts.iter().map(bind_string).collect::<Vec<_>>();
        let env = spec
            .environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>();

        let mut endpoints_config = HashMap::new();
        endpoints_config.insert(
            spec.network.clone(),
            EndpointSettings {
                aliases: Some(vec![spec.service.to_string()]),
                ..Default::default()
            },
        );

        let container_config = Config {
            hostname: Some(spec.service.to_string()),
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(to_hash_map(&spec.labels)),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: Some(spec.network.clone()),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.instance_name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .with_error_context(|| format!("Failed to create container '{}'.", spec.instance_name))?;
        debug!(service = %spec.service, "Created container '{}' (ID: {}).", spec.instance_name, response.id);

        self.docker
            .start_container::<String>(&spec.instance_name, None)
            .await
            .with_error_context(|| format!("Failed to start container '{}'.", spec.instance_name))?;

        if let Some(log_dir) = &self.log_dir {
            self.capture_container_logs(log_dir.join(&spec.project), &spec.service, &spec.instance_name)
                .await?;
        }

        // Catch instances whose main process exits straight away, such as on a bad command.
        let inspected = self.docker.inspect_container(&spec.instance_name, None).await?;
        let state = inspected.state.unwrap_or_default();
        if state.running != Some(true) {
            return Err(generic_error!(
                "Container '{}' exited right after starting (exit code: {}).",
                spec.instance_name,
                state.exit_code.unwrap_or_default()
            ));
        }

        Ok(InstanceHandle {
            service: spec.service.clone(),
            id: response.id,
            name: spec.instance_name.clone(),
            ports: spec.ports.clone(),
        })
    }

    async fn probe(&self, instance: &InstanceHandle, check: &ProbeCheck) -> Result<(), GenericError> {
        match check {
            ProbeCheck::Exec(command) => self.exec_probe(instance, command).await,
            ProbeCheck::Tcp(port) => self.tcp_probe(instance, *port).await,
        }
    }

    async fn stop(&self, instance: &InstanceHandle, timeout: Duration) -> Result<(), GenericError> {
        let stop_options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(&instance.name, Some(stop_options)).await {
            Ok(()) => debug!(service = %instance.service, "Stopped container '{}'.", instance.name),
            // Already stopped, or already gone.
            Err(Error::DockerResponseServerError { status_code: 304, .. }) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => {
                return Err(e).with_error_context(|| format!("Failed to stop container '{}'.", instance.name));
            }
        }

        match self.docker.remove_container(&instance.name, None).await {
            Ok(()) => {
                debug!(service = %instance.service, "Removed container '{}'.", instance.name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_error_context(|| format!("Failed to remove container '{}'.", instance.name)),
        }
    }

    async fn list_instances(&self, project: &str) -> Result<Vec<InstanceInfo>, GenericError> {
        let project_label = format!("{}={}", LABEL_PROJECT, project);
        let list_options = Some(ListContainersOptions {
            all: true,
            filters: vec![("label", vec![project_label.as_str()])].into_iter().collect(),
            ..Default::default()
        });
        let containers = self
            .docker
            .list_containers(list_options)
            .await
            .with_error_context(|| format!("Failed to list containers of project '{}'.", project))?;

        let mut instances = containers.into_iter().filter_map(instance_info).collect::<Vec<_>>();
        instances.sort_by(|a, b| a.handle.name.cmp(&b.handle.name));

        Ok(instances)
    }
}

fn instance_info(container: ContainerSummary) -> Option<InstanceInfo> {
    let service = container
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_SERVICE))
        .and_then(|service| ServiceName::try_from(service.as_str()).ok());
    let Some(service) = service else {
        debug!("Listed container {:?} has no valid service label. Skipping.", container.names);
        return None;
    };

    let name = container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let ports = container
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| {
            Some(PortBinding {
                host_ip: port.ip.as_deref().and_then(|ip| ip.parse().ok()),
                host_port: port.public_port?,
                container_port: port.private_port,
                protocol: match port.typ {
                    Some(PortTypeEnum::UDP) => Protocol::Udp,
                    _ => Protocol::Tcp,
                },
            })
        })
        .collect();

    let volumes = container
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|mount| mount.name)
        .collect();

    Some(InstanceInfo {
        handle: InstanceHandle {
            service,
            id: container.id.unwrap_or_default(),
            name,
            ports,
        },
        image: container.image.unwrap_or_default(),
        status: container.status.unwrap_or_default(),
        running: container.state.as_deref() == Some("running"),
        volumes,
    })
}

fn bind_string(mount: &RuntimeMount) -> String {
    let (source, target, read_only) = match mount {
        RuntimeMount::Volume { name, target, read_only } => (name.clone(), target, *read_only),
        RuntimeMount::Bind { path, target, read_only } => (path.display().to_string(), target, *read_only),
    };
    if read_only {
        format!("{}:{}:ro", source, target)
    } else {
        format!("{}:{}", source, target)
    }
}

/// Splits an image reference into the image and its tag, defaulting to `latest`.
///
/// Digest references are passed through whole.
fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    let last_segment = image.rfind('/').map_or(0, |idx| idx + 1);
    match image[last_segment..].rfind(':') {
        Some(idx) => (&image[..last_segment + idx], &image[last_segment + idx + 1..]),
        None => (image, "latest"),
    }
}

fn build_failure(tag: &str, error: &str, output_tail: &[String]) -> GenericError {
    generic_error!(
        "Failed to build image '{}': {}\n{}",
        tag,
        error.trim(),
        output_tail.concat().trim_end()
    )
}

fn push_tail(tail: &mut Vec<String>, line: String, limit: usize) {
    if tail.len() == limit {
        tail.remove(0);
    }
    tail.push(line);
}

async fn write_log(file: &mut BufWriter<tokio::fs::File>, message: &[u8]) -> std::io::Result<()> {
    file.write_all(message).await?;
    file.flush().await
}

fn to_hash_map(labels: &IndexMap<String, String>) -> HashMap<String, String> {
    labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::DockerResponseServerError { status_code: 404, .. })
}

/// Picks the instance's address on its networks, in network name order.
fn network_address(networks: &HashMap<String, EndpointSettings>) -> Option<IpAddr> {
    let mut names = networks.keys().collect::<Vec<_>>();
    names.sort();
    names.into_iter().find_map(|name| {
        let endpoint = &networks[name];
        [endpoint.ip_address.as_deref(), endpoint.global_ipv6_address.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|ip| ip.parse::<IpAddr>().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_references() {
        assert_eq!(split_image_reference("postgres:16"), ("postgres", "16"));
        assert_eq!(split_image_reference("redis"), ("redis", "latest"));
        assert_eq!(
            split_image_reference("localhost:5000/team/app"),
            ("localhost:5000/team/app", "latest")
        );
        assert_eq!(
            split_image_reference("localhost:5000/team/app:1.2"),
            ("localhost:5000/team/app", "1.2")
        );
        assert_eq!(split_image_reference("redis@sha256:abcd"), ("redis@sha256:abcd", ""));
    }

    #[test]
    fn bind_strings() {
        let volume = RuntimeMount::Volume {
            name: "store_postgres_data".to_string(),
            target: "/var/lib/postgresql/data".to_string(),
            read_only: false,
        };
        assert_eq!(bind_string(&volume), "store_postgres_data:/var/lib/postgresql/data");

        let bind = RuntimeMount::Bind {
            path: PathBuf::from("/srv/store/media"),
            target: "/app/media".to_string(),
            read_only: true,
        };
        assert_eq!(bind_string(&bind), "/srv/store/media:/app/media:ro");
    }

    #[test]
    fn build_output_tail_is_bounded() {
        let mut tail = Vec::new();
        for i in 0..(BUILD_OUTPUT_TAIL + 5) {
            push_tail(&mut tail, format!("line {}\n", i), BUILD_OUTPUT_TAIL);
        }
        assert_eq!(tail.len(), BUILD_OUTPUT_TAIL);
        assert_eq!(tail[0], "line 5\n");

        let err = build_failure("store-web:abc", "exit code 1", &tail[tail.len() - 1..]);
        assert_eq!(
            err.to_string(),
            format!("Failed to build image 'store-web:abc': exit code 1\nline {}", BUILD_OUTPUT_TAIL + 4)
        );
    }

    #[test]
    fn container_summary_mapping() {
        let mut labels = HashMap::new();
        labels.insert(LABEL_PROJECT.to_string(), "store".to_string());
        labels.insert(LABEL_SERVICE.to_string(), "web".to_string());

        let summary = ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec!["/store-web".to_string()]),
            image: Some("store-web:0123456789ab".to_string()),
            labels: Some(labels),
            state: Some("running".to_string()),
            status: Some("Up 3 minutes".to_string()),
            ports: Some(vec![
                bollard::models::Port {
                    ip: Some("127.0.0.1".to_string()),
                    private_port: 8000,
                    public_port: Some(8000),
                    typ: Some(PortTypeEnum::TCP),
                },
                bollard::models::Port {
                    ip: None,
                    private_port: 9000,
                    public_port: None,
                    typ: Some(PortTypeEnum::TCP),
                },
            ]),
            ..Default::default()
        };

        let info = instance_info(summary).unwrap();
        assert_eq!(info.handle.name, "store-web");
        assert_eq!(info.handle.service.to_string(), "web");
        assert!(info.running);
        assert_eq!(info.handle.ports.len(), 1);
        assert_eq!(info.handle.ports[0].to_string(), "127.0.0.1:8000:8000/tcp");

        assert!(instance_info(ContainerSummary::default()).is_none());
    }

    #[test]
    fn network_address_skips_unassigned_endpoints() {
        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some(String::new()),
                ..Default::default()
            },
        );
        networks.insert(
            "store_default".to_string(),
            EndpointSettings {
                ip_address: Some("172.20.0.3".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(network_address(&networks), Some("172.20.0.3".parse().unwrap()));

        networks.insert(
            "store_default".to_string(),
            EndpointSettings {
                ip_address: Some(String::new()),
                global_ipv6_address: Some("fd00::3".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(network_address(&networks), Some("fd00::3".parse().unwrap()));

        assert_eq!(network_address(&HashMap::new()), None);
    }
}
