//! Topology model.
//!
//! A topology is the validated, fully-resolved description of every service in a project: how its image is obtained,
//! what it depends on, what it mounts and publishes, the environment it runs with, and how its readiness is probed.
//! Topologies are produced by [`TopologyLoader`] and are immutable afterwards.

use std::{
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use berth_config::{ConfigurationError, ConfigurationSource};
use indexmap::IndexMap;
use serde::Serialize;
use snafu::Snafu;

mod document;
pub use self::document::parse_duration;

mod graph;
pub use self::graph::{DependencyGraph, GraphError};

mod ids;
pub use self::ids::ServiceName;

mod loader;
pub use self::loader::TopologyLoader;

/// Default interval between readiness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a single readiness probe may take.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of failed probes tolerated before a service is considered failed.
pub const DEFAULT_PROBE_RETRIES: u32 = 5;

/// Default working directory for built images.
pub const DEFAULT_BUILD_WORKDIR: &str = "/app";

/// Default volume driver.
pub const DEFAULT_VOLUME_DRIVER: &str = "local";

/// A topology error.
///
/// Topology errors are always raised before anything is launched.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum TopologyError {
    #[snafu(display("Failed to read topology file '{}'.", path.display()))]
    Read { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to parse topology: {}", source))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("Topology declares no services."))]
    NoServices,

    #[snafu(display("Invalid service name '{}': {}.", input, reason))]
    InvalidServiceName { input: String, reason: &'static str },

    #[snafu(display("Invalid project name '{}': {}.", input, reason))]
    InvalidProjectName { input: String, reason: &'static str },

    #[snafu(display("Service '{}' is declared more than once.", service))]
    DuplicateService { service: ServiceName },

    #[snafu(display("Service '{}' depends on undeclared service '{}'.", service, dependency))]
    UnknownDependency { service: ServiceName, dependency: String },

    #[snafu(display("Dependency cycle detected: {}.", render_cycle(path)))]
    Cycle { path: Vec<ServiceName> },

    #[snafu(display("Service '{}' has an invalid build source: {}.", service, reason))]
    InvalidBuildSource { service: ServiceName, reason: String },

    #[snafu(display("Service '{}' has an invalid port binding '{}': {}.", service, binding, reason))]
    InvalidPort {
        service: ServiceName,
        binding: String,
        reason: String,
    },

    #[snafu(display("Host port {} is published by both '{}' and '{}'.", port, first, second))]
    PortConflict {
        port: u16,
        first: ServiceName,
        second: ServiceName,
    },

    #[snafu(display("Service '{}' has an invalid volume mount '{}': {}.", service, mount, reason))]
    InvalidVolumeMount {
        service: ServiceName,
        mount: String,
        reason: String,
    },

    #[snafu(display("Service '{}' mounts undeclared volume '{}'.", service, volume))]
    UndeclaredVolume { service: ServiceName, volume: String },

    #[snafu(display(
        "Volume '{}' is mounted writable by more than one service ({}).",
        volume,
        render_list(services)
    ))]
    SharedVolumeWriter { volume: String, services: Vec<ServiceName> },

    #[snafu(display("Service '{}' has an invalid readiness probe: {}.", service, reason))]
    InvalidProbe { service: ServiceName, reason: String },

    #[snafu(display("Service '{}' references undeclared configuration source '{}'.", service, config))]
    UnknownConfigSource { service: ServiceName, config: String },

    #[snafu(display("{}", source))]
    Configuration { source: ConfigurationError },
}

impl From<GraphError> for TopologyError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::DuplicateService { service } => Self::DuplicateService { service },
            GraphError::UnknownDependency { service, dependency } => Self::UnknownDependency { service, dependency },
            GraphError::Cycle { path } => Self::Cycle { path },
        }
    }
}

fn render_cycle(path: &[ServiceName]) -> String {
    path.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" -> ")
}

fn render_list(services: &[ServiceName]) -> String {
    services.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

/// How a service's image is obtained.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSource {
    /// A prebuilt image, pulled if it isn't present locally.
    Image(String),

    /// An image built from local sources.
    Build(BuildRecipe),
}

/// Recipe for building a service image from a local source tree.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct BuildRecipe {
    /// Absolute path to the build context.
    pub context: PathBuf,

    /// Base runtime image.
    pub base: Option<String>,

    /// Working directory inside the image.
    pub workdir: String,

    /// Dependency manifest, relative to the context. Copied and installed before the rest of the source tree.
    pub manifest: Option<PathBuf>,

    /// Shell command installing dependencies from the manifest.
    pub install: Option<String>,

    /// One-shot build-time preparation step, such as static asset collection.
    pub prepare: Option<String>,

    /// Custom Dockerfile, relative to the context. Replaces the generated one.
    pub dockerfile: Option<PathBuf>,
}

/// Transport protocol of a published port.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A container port published on the host.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct PortBinding {
    pub host_ip: Option<IpAddr>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(f, "{}:{}/{}", self.host_port, self.container_port, self.protocol)
    }
}

/// Where the contents of a mount come from.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    /// A declared named volume.
    Volume(String),

    /// A host path, resolved to an absolute path.
    Bind(PathBuf),
}

/// A mount inside a service's container.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct VolumeMount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

/// A durable named volume.
///
/// Volumes outlive every service that mounts them, and are only ever removed by an explicit administrative action.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VolumeDefinition {
    pub name: String,
    pub driver: String,
    pub labels: IndexMap<String, String>,
}

/// What a readiness probe checks.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCheck {
    /// Runs a command inside the service; exit code zero means ready.
    Exec(Vec<String>),

    /// Connects to a container port on the instance's own network address.
    Tcp(u16),
}

/// A readiness probe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ReadinessProbe {
    pub check: ProbeCheck,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(with = "duration_millis")]
    pub start_period: Duration,
}

impl ReadinessProbe {
    /// Creates a probe with default timing.
    pub fn new(check: ProbeCheck) -> Self {
        Self {
            check,
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
            retries: DEFAULT_PROBE_RETRIES,
            start_period: Duration::ZERO,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// A fully-resolved service.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceDefinition {
    pub name: ServiceName,
    pub source: ServiceSource,
    pub command: Option<Vec<String>>,
    pub depends_on: Vec<ServiceName>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeMount>,

    /// Name of the shared configuration source, if any.
    pub env_source: Option<String>,

    /// Complete environment: every key of the shared source, followed by the service's own keys.
    pub environment: IndexMap<String, String>,

    pub readiness: Option<ReadinessProbe>,
}

impl ServiceDefinition {
    /// Names of the named volumes this service mounts.
    pub fn named_volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().filter_map(|mount| match &mount.source {
            MountSource::Volume(name) => Some(name.as_str()),
            MountSource::Bind(_) => None,
        })
    }
}

/// A validated topology.
#[derive(Debug)]
pub struct Topology {
    project: String,
    root: PathBuf,
    services: IndexMap<ServiceName, ServiceDefinition>,
    volumes: IndexMap<String, VolumeDefinition>,
    configs: IndexMap<String, ConfigurationSource>,
    graph: DependencyGraph,
    activation_order: Vec<ServiceName>,
}

impl Topology {
    /// Project name, used to scope every runtime resource the topology creates.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Directory relative paths in the topology were resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Services in declaration order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &VolumeDefinition> {
        self.volumes.values()
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeDefinition> {
        self.volumes.get(name)
    }

    pub fn configs(&self) -> impl Iterator<Item = &ConfigurationSource> {
        self.configs.values()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Services in an order where every service comes after all of its dependencies.
    pub fn activation_order(&self) -> &[ServiceName] {
        &self.activation_order
    }

    /// Overrides the project name.
    ///
    /// # Errors
    ///
    /// If the name is not a valid identifier, an error will be returned.
    pub fn with_project(mut self, project: &str) -> Result<Self, TopologyError> {
        self.project = loader::normalize_project_name(project)?;
        Ok(self)
    }
}
