use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    path::{Component, Path, PathBuf},
};

use berth_config::ConfigurationSource;
use indexmap::IndexMap;
use snafu::ResultExt as _;
use tracing::debug;

use super::{
    document::{BuildDocument, ReadinessDocument, ServiceDocument, TopologyDocument},
    BuildRecipe, Configuration, DependencyGraph, MountSource, Parse, PortBinding, ProbeCheck, Protocol, Read,
    ReadinessProbe, ServiceDefinition, ServiceName, ServiceSource, Topology, TopologyError, VolumeDefinition,
    VolumeMount, DEFAULT_BUILD_WORKDIR, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_RETRIES, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_VOLUME_DRIVER,
};

const DEFAULT_PROJECT_NAME: &str = "berth";

/// Loads and validates topology files.
///
/// Loading has no side effects beyond reading the topology file and the configuration sources it references. Every
/// structural problem (undeclared dependencies, cycles, dangling volume or configuration references, malformed port
/// and mount bindings) is reported here, before anything is launched.
pub struct TopologyLoader;

impl TopologyLoader {
    /// Loads the topology file at `path`.
    ///
    /// Relative paths inside the file are resolved against the file's directory, whose name is also the default
    /// project name.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or the topology is invalid, an error will be returned.
    pub fn load<P>(path: P) -> Result<Topology, TopologyError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(Read { path })?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let root = std::fs::canonicalize(parent).context(Read { path: parent })?;

        Self::load_str(&contents, root)
    }

    /// Loads a topology from an in-memory document, resolving relative paths against `root`.
    ///
    /// # Errors
    ///
    /// If the topology is invalid, an error will be returned.
    pub fn load_str<R>(contents: &str, root: R) -> Result<Topology, TopologyError>
    where
        R: Into<PathBuf>,
    {
        let root = root.into();
        let document: TopologyDocument = serde_yaml::from_str(contents).context(Parse)?;
        if document.services.is_empty() {
            return Err(TopologyError::NoServices);
        }

        let project = match &document.name {
            Some(name) => normalize_project_name(name)?,
            None => root
                .file_name()
                .and_then(|name| name.to_str())
                .map(sanitize_project_name)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
        };

        let mut configs = IndexMap::new();
        for (name, config) in &document.configs {
            let source =
                ConfigurationSource::load(name.clone(), resolve_path(&root, config.path())).context(Configuration)?;
            configs.insert(name.clone(), source);
        }

        let volumes = document
            .volumes
            .into_iter()
            .map(|(name, volume)| {
                let volume = volume.unwrap_or_default();
                let definition = VolumeDefinition {
                    name: name.clone(),
                    driver: volume.driver.unwrap_or_else(|| DEFAULT_VOLUME_DRIVER.to_string()),
                    labels: volume.labels,
                };
                (name, definition)
            })
            .collect::<IndexMap<_, _>>();

        let mut graph = DependencyGraph::default();
        let mut services = IndexMap::new();
        for (raw_name, service) in document.services {
            let name = ServiceName::try_from(raw_name.as_str()).map_err(|reason| TopologyError::InvalidServiceName {
                input: raw_name.clone(),
                reason,
            })?;

            graph.add_service(name.clone(), service.depends_on.iter().cloned())?;

            let definition = resolve_service(&root, name.clone(), service, &volumes, &configs)?;
            services.insert(name, definition);
        }

        let activation_order = graph.activation_order()?;

        check_port_conflicts(&services)?;
        check_shared_writers(&services)?;

        debug!(
            project = %project,
            services = services.len(),
            volumes = volumes.len(),
            order = ?activation_order.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            "Loaded topology."
        );

        Ok(Topology {
            project,
            root,
            services,
            volumes,
            configs,
            graph,
            activation_order,
        })
    }
}

pub(super) fn normalize_project_name(raw: &str) -> Result<String, TopologyError> {
    let name = raw.trim().to_lowercase();
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(name)
    } else {
        Err(TopologyError::InvalidProjectName {
            input: raw.to_string(),
            reason: "project names must start with an alphanumeric and may only contain alphanumerics, underscores, and hyphens",
        })
    }
}

/// Derives a project name from a directory name, dropping characters that aren't allowed.
fn sanitize_project_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .skip_while(|c| !c.is_ascii_alphanumeric())
        .collect()
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    joined.components().filter(|c| !matches!(c, Component::CurDir)).collect()
}

fn resolve_service(
    root: &Path, name: ServiceName, service: ServiceDocument, volumes: &IndexMap<String, VolumeDefinition>,
    configs: &IndexMap<String, ConfigurationSource>,
) -> Result<ServiceDefinition, TopologyError> {
    let source = match (service.image, service.build) {
        (Some(image), None) if !image.trim().is_empty() => ServiceSource::Image(image),
        (Some(_), None) => {
            return Err(TopologyError::InvalidBuildSource {
                service: name,
                reason: "image reference is empty".to_string(),
            })
        }
        (None, Some(build)) => ServiceSource::Build(resolve_build(root, &name, build)?),
        (Some(_), Some(_)) => {
            return Err(TopologyError::InvalidBuildSource {
                service: name,
                reason: "only one of `image` or `build` may be given".to_string(),
            })
        }
        (None, None) => {
            return Err(TopologyError::InvalidBuildSource {
                service: name,
                reason: "one of `image` or `build` is required".to_string(),
            })
        }
    };

    let ports = service
        .ports
        .iter()
        .map(|binding| {
            parse_port(binding).map_err(|reason| TopologyError::InvalidPort {
                service: name.clone(),
                binding: binding.clone(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut mounts = Vec::with_capacity(service.volumes.len());
    for raw in &service.volumes {
        let mount = parse_mount(root, raw).map_err(|reason| TopologyError::InvalidVolumeMount {
            service: name.clone(),
            mount: raw.clone(),
            reason,
        })?;
        if let MountSource::Volume(volume) = &mount.source {
            if !volumes.contains_key(volume) {
                return Err(TopologyError::UndeclaredVolume {
                    service: name,
                    volume: volume.clone(),
                });
            }
        }
        mounts.push(mount);
    }

    let extra = service
        .environment
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect::<IndexMap<_, _>>();
    let environment = match &service.env {
        Some(config) => {
            let source = configs.get(config).ok_or_else(|| TopologyError::UnknownConfigSource {
                service: name.clone(),
                config: config.clone(),
            })?;
            source.compose(&name, &extra).context(Configuration)?
        }
        None => extra,
    };

    let readiness = service
        .readiness
        .map(|probe| resolve_probe(&name, probe))
        .transpose()?;

    // Dependencies were checked by the graph; anything that isn't a valid name can't have been declared.
    let depends_on = service
        .depends_on
        .into_iter()
        .map(|dep| {
            ServiceName::try_from(dep.as_str()).map_err(|_| TopologyError::UnknownDependency {
                service: name.clone(),
                dependency: dep.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ServiceDefinition {
        name,
        source,
        command: service.command.map(|c| c.into_argv()).filter(|argv| !argv.is_empty()),
        depends_on,
        ports,
        volumes: mounts,
        env_source: service.env,
        environment,
        readiness,
    })
}

fn resolve_build(root: &Path, service: &ServiceName, build: BuildDocument) -> Result<BuildRecipe, TopologyError> {
    let invalid = |reason: &str| TopologyError::InvalidBuildSource {
        service: service.clone(),
        reason: reason.to_string(),
    };

    if build.base.is_none() && build.dockerfile.is_none() {
        return Err(invalid("a build needs either a `base` image or a custom `dockerfile`"));
    }
    if build.manifest.as_deref().is_some_and(escapes_context) {
        return Err(invalid("`manifest` must be a relative path inside the build context"));
    }
    if build.dockerfile.as_deref().is_some_and(escapes_context) {
        return Err(invalid("`dockerfile` must be a relative path inside the build context"));
    }
    if build.dockerfile.is_some() && (build.base.is_some() || build.manifest.is_some() || build.install.is_some()) {
        return Err(invalid("a custom `dockerfile` can't be combined with `base`, `manifest`, or `install`"));
    }
    if build.install.is_some() && build.manifest.is_none() {
        return Err(invalid("`install` requires a dependency `manifest`"));
    }

    let workdir = build.workdir.unwrap_or_else(|| DEFAULT_BUILD_WORKDIR.to_string());
    if !workdir.starts_with('/') {
        return Err(invalid("`workdir` must be an absolute path"));
    }

    Ok(BuildRecipe {
        context: resolve_path(root, &build.context),
        base: build.base,
        workdir,
        manifest: build.manifest,
        install: build.install,
        prepare: build.prepare,
        dockerfile: build.dockerfile,
    })
}

fn escapes_context(path: &Path) -> bool {
    path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir))
}

fn resolve_probe(service: &ServiceName, probe: ReadinessDocument) -> Result<ReadinessProbe, TopologyError> {
    let invalid = |reason: String| TopologyError::InvalidProbe {
        service: service.clone(),
        reason,
    };

    let check = match (probe.exec, probe.tcp) {
        (Some(command), None) => {
            let argv = command.into_argv();
            if argv.is_empty() {
                return Err(invalid("`exec` command is empty".to_string()));
            }
            ProbeCheck::Exec(argv)
        }
        (None, Some(0)) => return Err(invalid("`tcp` port must not be zero".to_string())),
        (None, Some(port)) => ProbeCheck::Tcp(port),
        (Some(_), Some(_)) => return Err(invalid("only one of `exec` or `tcp` may be given".to_string())),
        (None, None) => return Err(invalid("one of `exec` or `tcp` is required".to_string())),
    };

    let retries = probe.retries.unwrap_or(DEFAULT_PROBE_RETRIES);
    if retries == 0 {
        return Err(invalid("`retries` must be at least 1".to_string()));
    }

    let timeout = probe.timeout.map(|d| d.0).unwrap_or(DEFAULT_PROBE_TIMEOUT);
    if timeout.is_zero() {
        return Err(invalid("`timeout` must be greater than zero".to_string()));
    }

    Ok(ReadinessProbe {
        check,
        interval: probe.interval.map(|d| d.0).unwrap_or(DEFAULT_PROBE_INTERVAL),
        timeout,
        retries,
        start_period: probe.start_period.map(|d| d.0).unwrap_or_default(),
    })
}

fn parse_port(binding: &str) -> Result<PortBinding, String> {
    let (spec, protocol) = match binding.rsplit_once('/') {
        Some((spec, "tcp")) => (spec, Protocol::Tcp),
        Some((spec, "udp")) => (spec, Protocol::Udp),
        Some((_, other)) => return Err(format!("unknown protocol '{}'", other)),
        None => (binding, Protocol::Tcp),
    };

    // Split from the right so IPv6 host addresses keep their colons.
    let mut parts = spec.rsplitn(3, ':');
    let container = parts.next().unwrap_or_default();
    let host = parts
        .next()
        .ok_or_else(|| "expected HOST_PORT:CONTAINER_PORT".to_string())?;
    let host_ip = parts
        .next()
        .map(|ip| {
            ip.trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| format!("invalid host address '{}'", ip))
        })
        .transpose()?;

    Ok(PortBinding {
        host_ip,
        host_port: parse_port_number(host)?,
        container_port: parse_port_number(container)?,
        protocol,
    })
}

fn parse_port_number(raw: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{}' is not a valid port number", raw)),
        Ok(port) => Ok(port),
    }
}

fn parse_mount(root: &Path, raw: &str) -> Result<VolumeMount, String> {
    let parts = raw.split(':').collect::<Vec<_>>();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        [_, _, mode] => return Err(format!("unknown mount mode '{}'", mode)),
        _ => return Err("expected SOURCE:TARGET[:ro|rw]".to_string()),
    };

    if !target.starts_with('/') {
        return Err("mount target must be an absolute path".to_string());
    }

    let source = if source.is_empty() {
        return Err("mount source is empty".to_string());
    } else if source.starts_with('~') {
        return Err("home-relative mount sources are not supported".to_string());
    } else if source.starts_with('/') || source.starts_with('.') {
        MountSource::Bind(resolve_path(root, Path::new(source)))
    } else if source
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        MountSource::Volume(source.to_string())
    } else {
        return Err(format!("'{}' is neither a volume name nor a path", source));
    };

    Ok(VolumeMount {
        source,
        target: target.to_string(),
        read_only,
    })
}

fn check_port_conflicts(services: &IndexMap<ServiceName, ServiceDefinition>) -> Result<(), TopologyError> {
    let mut claimed: HashMap<(u16, Protocol), &ServiceName> = HashMap::new();
    for service in services.values() {
        for port in &service.ports {
            if let Some(first) = claimed.insert((port.host_port, port.protocol), &service.name) {
                if first != &service.name {
                    return Err(TopologyError::PortConflict {
                        port: port.host_port,
                        first: first.clone(),
                        second: service.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_shared_writers(services: &IndexMap<ServiceName, ServiceDefinition>) -> Result<(), TopologyError> {
    let mut writers: IndexMap<&str, Vec<&ServiceName>> = IndexMap::new();
    for service in services.values() {
        let mut seen = HashSet::new();
        for mount in service.volumes.iter().filter(|m| !m.read_only) {
            if let MountSource::Volume(volume) = &mount.source {
                if seen.insert(volume.as_str()) {
                    writers.entry(volume.as_str()).or_default().push(&service.name);
                }
            }
        }
    }

    match writers.into_iter().find(|(_, services)| services.len() > 1) {
        Some((volume, services)) => Err(TopologyError::SharedVolumeWriter {
            volume: volume.to_string(),
            services: services.into_iter().cloned().collect(),
        }),
        None => Ok(()),
    }
}
