//! Container runtime abstraction.
//!
//! Everything berth does to the outside world (networks, volumes, images, and service instances) goes through
//! [`ContainerRuntime`]. The orchestrator, volume manager, and image builder only ever see this trait, which keeps them
//! independent of any particular container engine.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use berth_error::GenericError;
use indexmap::IndexMap;
use serde::Serialize;

use crate::topology::{MountSource, PortBinding, ProbeCheck, ServiceDefinition, ServiceName, VolumeDefinition};

/// Label marking every resource berth creates.
pub const LABEL_CREATED_BY: &str = "created_by";

/// Value of [`LABEL_CREATED_BY`].
pub const CREATED_BY_BERTH: &str = "berth";

/// Label holding the owning project name.
pub const LABEL_PROJECT: &str = "berth.project";

/// Label holding the service name of an instance.
pub const LABEL_SERVICE: &str = "berth.service";

/// Label holding the unscoped name of a volume.
pub const LABEL_VOLUME: &str = "berth.volume";

/// Labels attached to every resource belonging to `project`.
pub fn project_labels(project: &str) -> IndexMap<String, String> {
    let mut labels = IndexMap::new();
    labels.insert(LABEL_CREATED_BY.to_string(), CREATED_BY_BERTH.to_string());
    labels.insert(LABEL_PROJECT.to_string(), project.to_string());
    labels
}

/// Name of the network all instances of `project` are attached to.
pub fn network_name(project: &str) -> String {
    format!("{}_default", project)
}

/// Runtime name of a service instance.
pub fn instance_name(project: &str, service: &str) -> String {
    format!("{}-{}", project, service)
}

/// Runtime name of a named volume.
pub fn volume_name(project: &str, volume: &str) -> String {
    format!("{}_{}", project, volume)
}

/// A volume to create.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    /// Project-scoped runtime name.
    pub name: String,
    pub driver: String,
    pub labels: IndexMap<String, String>,
}

impl VolumeSpec {
    pub fn for_volume(project: &str, volume: &VolumeDefinition) -> Self {
        let mut labels = project_labels(project);
        labels.insert(LABEL_VOLUME.to_string(), volume.name.clone());
        labels.extend(volume.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            name: volume_name(project, &volume.name),
            driver: volume.driver.clone(),
            labels,
        }
    }
}

/// A volume as reported by the runtime.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VolumeInfo {
    /// Project-scoped runtime name.
    pub name: String,
    pub driver: String,
    /// Unscoped name, when the volume was created by berth.
    pub volume: Option<String>,
}

/// A mount as handed to the runtime, with volume names already scoped to the project.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeMount {
    Volume { name: String, target: String, read_only: bool },
    Bind { path: PathBuf, target: String, read_only: bool },
}

/// Everything needed to create and start one service instance.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub project: String,
    pub service: ServiceName,
    pub instance_name: String,
    pub network: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub environment: IndexMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<RuntimeMount>,
    pub labels: IndexMap<String, String>,
}

impl LaunchSpec {
    /// Builds the launch spec of `service`, running `image`.
    pub fn for_service(project: &str, service: &ServiceDefinition, image: &str) -> Self {
        let mounts = service
            .volumes
            .iter()
            .map(|mount| match &mount.source {
                MountSource::Volume(volume) => RuntimeMount::Volume {
                    name: volume_name(project, volume),
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                },
                MountSource::Bind(path) => RuntimeMount::Bind {
                    path: path.clone(),
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                },
            })
            .collect();

        let mut labels = project_labels(project);
        labels.insert(LABEL_SERVICE.to_string(), service.name.to_string());

        Self {
            project: project.to_string(),
            service: service.name.clone(),
            instance_name: instance_name(project, &service.name),
            network: network_name(project),
            image: image.to_string(),
            command: service.command.clone(),
            environment: service.environment.clone(),
            ports: service.ports.clone(),
            mounts,
            labels,
        }
    }
}

/// A launched service instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceHandle {
    pub service: ServiceName,
    /// Runtime identifier of the instance.
    pub id: String,
    pub name: String,
    pub ports: Vec<PortBinding>,
}

/// An instance as reported by the runtime.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub handle: InstanceHandle,
    pub image: String,
    /// Runtime-reported status, such as `running` or `exited`.
    pub status: String,
    pub running: bool,
    /// Runtime names of the named volumes the instance mounts.
    pub volumes: Vec<String>,
}

/// An image build request.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Tag to apply to the built image.
    pub tag: String,
    /// Services the image is built for.
    pub services: Vec<ServiceName>,
    /// Uncompressed tar archive of the build context, including the Dockerfile.
    pub context: Vec<u8>,
    /// Path of the Dockerfile inside the archive.
    pub dockerfile: String,
    pub labels: IndexMap<String, String>,
}

/// A container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates the project network, if it doesn't already exist.
    async fn ensure_network(&self, project: &str) -> Result<(), GenericError>;

    /// Removes the project network, if it exists.
    async fn remove_network(&self, project: &str) -> Result<(), GenericError>;

    /// Looks up a volume by its runtime name.
    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>, GenericError>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), GenericError>;

    /// Lists the volumes belonging to `project`.
    async fn list_volumes(&self, project: &str) -> Result<Vec<VolumeInfo>, GenericError>;

    async fn remove_volume(&self, name: &str) -> Result<(), GenericError>;

    async fn image_exists(&self, tag: &str) -> Result<bool, GenericError>;

    /// Builds and tags an image.
    ///
    /// On failure, the error should carry the runtime's build output for the failing step, so callers can tell which
    /// step failed.
    async fn build_image(&self, request: &BuildRequest) -> Result<(), GenericError>;

    /// Creates and starts a service instance, replacing any existing instance of the same name.
    ///
    /// Images that aren't present locally are pulled first.
    async fn launch(&self, spec: &LaunchSpec) -> Result<InstanceHandle, GenericError>;

    /// Runs one readiness check against an instance. `Ok` means ready.
    async fn probe(&self, instance: &InstanceHandle, check: &ProbeCheck) -> Result<(), GenericError>;

    /// Stops and removes an instance, waiting at most `timeout` for it to exit before killing it.
    async fn stop(&self, instance: &InstanceHandle, timeout: Duration) -> Result<(), GenericError>;

    /// Lists the instances belonging to `project`, running or not.
    async fn list_instances(&self, project: &str) -> Result<Vec<InstanceInfo>, GenericError>;
}
