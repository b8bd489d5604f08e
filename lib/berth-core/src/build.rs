//! Image building.
//!
//! Built images are tagged by a fingerprint of everything that goes into them: the generated (or custom) Dockerfile,
//! and the path and contents of every file in the build context. An image whose tag already exists is never rebuilt,
//! so the build-time preparation step runs exactly once per distinct source state and never at instance launch.

use std::{
    io,
    path::{Path, PathBuf},
};

use berth_error::GenericError;
use indexmap::IndexMap;
use serde::Serialize;
use sha3::{Digest as _, Sha3_256};
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info, warn};

use crate::{
    events::{ActivationEvent, EventSink},
    runtime::{project_labels, BuildRequest, ContainerRuntime, LABEL_SERVICE},
    topology::{BuildRecipe, ServiceName, ServiceSource, Topology},
};

/// Name of the Dockerfile inside the build archive.
pub const DOCKERFILE_NAME: &str = ".berth.Dockerfile";

/// Number of fingerprint characters used in image tags.
const TAG_FINGERPRINT_LEN: usize = 12;

/// Directory names never included in a build context.
const IGNORED_NAMES: &[&str] = &[".git", DOCKERFILE_NAME];

/// A build error.
///
/// Build errors are fatal: no image is tagged for the failing build, and nothing is launched.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum BuildError {
    #[snafu(display("Build context '{}' of service '{}' is not a directory.", path.display(), service))]
    MissingContext { service: ServiceName, path: PathBuf },

    #[snafu(display("Dependency manifest '{}' of service '{}' does not exist.", path.display(), service))]
    MissingManifest { service: ServiceName, path: PathBuf },

    #[snafu(display("Dockerfile '{}' of service '{}' does not exist.", path.display(), service))]
    MissingDockerfile { service: ServiceName, path: PathBuf },

    #[snafu(display("Failed to read '{}' while building service '{}'.", path.display(), service))]
    ReadSource {
        service: ServiceName,
        path: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Preparation step `{}` failed while building service '{}': {}", command, service, message))]
    PreparationFailed {
        service: ServiceName,
        command: String,
        message: String,
    },

    #[snafu(display("Failed to build image for service '{}': {}", service, message))]
    BuildFailed { service: ServiceName, message: String },

    #[snafu(display("Image '{}' for service '{}' has not been built.", image, service))]
    ImageMissing { service: ServiceName, image: String },

    #[snafu(display("Container runtime error while building service '{}'.", service))]
    Runtime { service: ServiceName, source: GenericError },
}

/// When images may be built.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildPolicy {
    /// Build every image that doesn't exist yet.
    Missing,

    /// Never build; every image must already exist.
    Never,
}

/// Whether an image had to be built.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Built,
    Cached,
}

/// One built image, possibly shared by several services.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ImageBuild {
    pub tag: String,
    pub fingerprint: String,
    pub services: Vec<ServiceName>,
    pub status: BuildStatus,
}

/// Image to run for every service of a topology.
#[derive(Clone, Debug, Default)]
pub struct ResolvedImages {
    images: IndexMap<ServiceName, String>,
    builds: Vec<ImageBuild>,
}

impl ResolvedImages {
    pub fn image_for(&self, service: &str) -> Option<&str> {
        self.images.get(service).map(String::as_str)
    }

    pub fn builds(&self) -> &[ImageBuild] {
        &self.builds
    }
}

/// Builds the images of a project.
pub struct ImageBuilder<'a, R: ?Sized> {
    runtime: &'a R,
    project: &'a str,
    events: EventSink,
}

impl<'a, R> ImageBuilder<'a, R>
where
    R: ContainerRuntime + ?Sized,
{
    pub fn new(runtime: &'a R, project: &'a str) -> Self {
        Self {
            runtime,
            project,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Determines the image of every service in `topology`, building images as allowed by `policy`.
    ///
    /// Services with identical build recipes share a single image, tagged after the first of them.
    pub async fn resolve(&self, topology: &Topology, policy: BuildPolicy) -> Result<ResolvedImages, BuildError> {
        let mut resolved = ResolvedImages::default();

        let mut recipes: IndexMap<&BuildRecipe, Vec<ServiceName>> = IndexMap::new();
        for service in topology.services() {
            match &service.source {
                ServiceSource::Image(image) => {
                    resolved.images.insert(service.name.clone(), image.clone());
                }
                ServiceSource::Build(recipe) => recipes.entry(recipe).or_default().push(service.name.clone()),
            }
        }

        for (recipe, services) in recipes {
            let build = self.build_recipe(recipe, services, policy).await?;
            for service in &build.services {
                resolved.images.insert(service.clone(), build.tag.clone());
            }
            resolved.builds.push(build);
        }

        Ok(resolved)
    }

    async fn build_recipe(
        &self, recipe: &BuildRecipe, services: Vec<ServiceName>, policy: BuildPolicy,
    ) -> Result<ImageBuild, BuildError> {
        // Recipes are grouped from the services that use them, so there is always at least one.
        let owner = services[0].clone();
        let context = BuildContext::collect(&owner, recipe)?;
        let fingerprint = context.fingerprint(&owner)?;
        let tag = format!(
            "{}-{}:{}",
            self.project,
            owner,
            &fingerprint[..TAG_FINGERPRINT_LEN]
        );

        let exists = self
            .runtime
            .image_exists(&tag)
            .await
            .context(Runtime { service: owner.clone() })?;
        if exists {
            debug!(service = %owner, image = %tag, "Image is up to date. Skipping build.");
            self.events.emit(ActivationEvent::ImageReady {
                tag: tag.clone(),
                built: false,
            });
            return Ok(ImageBuild {
                tag,
                fingerprint,
                services,
                status: BuildStatus::Cached,
            });
        }

        if policy == BuildPolicy::Never {
            return Err(BuildError::ImageMissing {
                service: owner,
                image: tag,
            });
        }

        info!(service = %owner, image = %tag, files = context.files.len(), "Building image...");
        self.events.emit(ActivationEvent::ImageBuilding {
            tag: tag.clone(),
            services: services.clone(),
        });

        let mut labels = project_labels(self.project);
        labels.insert(LABEL_SERVICE.to_string(), owner.to_string());
        let request = BuildRequest {
            tag: tag.clone(),
            services: services.clone(),
            context: context.archive(&owner)?,
            dockerfile: DOCKERFILE_NAME.to_string(),
            labels,
        };

        if let Err(e) = self.runtime.build_image(&request).await {
            let message = format!("{:#}", e);
            warn!(service = %owner, image = %tag, error = %message, "Image build failed.");
            return Err(match &recipe.prepare {
                Some(command) if message.contains(command.as_str()) => BuildError::PreparationFailed {
                    service: owner,
                    command: command.clone(),
                    message,
                },
                _ => BuildError::BuildFailed { service: owner, message },
            });
        }

        info!(service = %owner, image = %tag, "Built image.");
        self.events.emit(ActivationEvent::ImageReady {
            tag: tag.clone(),
            built: true,
        });

        Ok(ImageBuild {
            tag,
            fingerprint,
            services,
            status: BuildStatus::Built,
        })
    }
}

/// Renders the Dockerfile for a recipe without a custom one.
pub fn render_dockerfile(recipe: &BuildRecipe) -> String {
    let mut lines = vec![
        "# Generated by berth.".to_string(),
        format!("FROM {}", recipe.base.as_deref().unwrap_or_default()),
        format!("WORKDIR {}", recipe.workdir),
    ];

    if let Some(manifest) = &recipe.manifest {
        let manifest = archive_path(manifest);
        lines.push(format!("COPY {} {}", manifest, manifest));
    }
    if let Some(install) = &recipe.install {
        lines.push(format!("RUN {}", install));
    }

    lines.push("COPY . .".to_string());

    if let Some(prepare) = &recipe.prepare {
        lines.push(format!("RUN {}", prepare));
    }

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

fn archive_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The files and Dockerfile making up one build.
struct BuildContext {
    root: PathBuf,
    /// Paths relative to `root`, sorted.
    files: Vec<PathBuf>,
    dockerfile: String,
}

impl BuildContext {
    fn collect(service: &ServiceName, recipe: &BuildRecipe) -> Result<Self, BuildError> {
        let root = recipe.context.clone();
        if !root.is_dir() {
            return Err(BuildError::MissingContext {
                service: service.clone(),
                path: root,
            });
        }

        if let Some(manifest) = &recipe.manifest {
            let path = root.join(manifest);
            if !path.is_file() {
                return Err(BuildError::MissingManifest {
                    service: service.clone(),
                    path,
                });
            }
        }

        let dockerfile = match &recipe.dockerfile {
            Some(custom) => {
                let path = root.join(custom);
                if !path.is_file() {
                    return Err(BuildError::MissingDockerfile {
                        service: service.clone(),
                        path,
                    });
                }
                let mut contents = std::fs::read_to_string(&path).context(ReadSource {
                    service: service.clone(),
                    path: path.clone(),
                })?;
                if let Some(prepare) = &recipe.prepare {
                    if !contents.ends_with('\n') {
                        contents.push('\n');
                    }
                    contents.push_str(&format!("RUN {}\n", prepare));
                }
                contents
            }
            None => render_dockerfile(recipe),
        };

        let mut files = Vec::new();
        walk(&root, Path::new(""), &mut files).context(ReadSource {
            service: service.clone(),
            path: root.clone(),
        })?;

        Ok(Self {
            root,
            files,
            dockerfile,
        })
    }

    /// SHA3-256 over the Dockerfile and the path and contents of every file, as lowercase hex.
    fn fingerprint(&self, service: &ServiceName) -> Result<String, BuildError> {
        let mut hasher = Sha3_256::new();
        hasher.update(self.dockerfile.as_bytes());

        for file in &self.files {
            let path = self.root.join(file);
            let contents = std::fs::read(&path).context(ReadSource {
                service: service.clone(),
                path,
            })?;

            hasher.update([0u8]);
            hasher.update(archive_path(file).as_bytes());
            hasher.update([0u8]);
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Packs the context and Dockerfile into an uncompressed tar archive.
    fn archive(&self, service: &ServiceName) -> Result<Vec<u8>, BuildError> {
        let mut builder = tar::Builder::new(Vec::new());

        for file in &self.files {
            let path = self.root.join(file);
            builder
                .append_path_with_name(&path, archive_path(file))
                .context(ReadSource {
                    service: service.clone(),
                    path,
                })?;
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(self.dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, DOCKERFILE_NAME, self.dockerfile.as_bytes())
            .context(ReadSource {
                service: service.clone(),
                path: self.root.join(DOCKERFILE_NAME),
            })?;

        builder.into_inner().context(ReadSource {
            service: service.clone(),
            path: self.root.clone(),
        })
    }
}

/// Collects every regular file below `root.join(relative)` in a stable order.
fn walk(root: &Path, relative: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = std::fs::read_dir(root.join(relative))?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        if IGNORED_NAMES.iter().any(|ignored| name == *ignored) {
            continue;
        }

        let path = relative.join(&name);
        let metadata = std::fs::metadata(entry.path())?;
        if metadata.is_dir() {
            walk(root, &path, files)?;
        } else if metadata.is_file() {
            files.push(path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;
    use crate::{
        test_util::{service, RuntimeCall, ScriptedRuntime},
        topology::TopologyLoader,
    };

    const PREPARE: &str = "python manage.py collectstatic --noinput";

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "django==5.0\ncelery==5.3\n").unwrap();
        std::fs::write(dir.path().join("manage.py"), "print('manage')\n").unwrap();
        std::fs::create_dir_all(dir.path().join("store/static")).unwrap();
        std::fs::write(dir.path().join("store/settings.py"), "DEBUG = False\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        dir
    }

    fn topology(root: &Path) -> Topology {
        let yaml = format!(
            r#"
name: store
services:
  web:
    build: &app
      context: .
      base: python:3.12-slim
      manifest: requirements.txt
      install: pip install -r requirements.txt
      prepare: {}
  worker:
    build: *app
  redis:
    image: redis:7
"#,
            PREPARE
        );
        TopologyLoader::load_str(&yaml, root).unwrap()
    }

    fn recipe(topology: &Topology) -> BuildRecipe {
        match &topology.service("web").unwrap().source {
            ServiceSource::Build(recipe) => recipe.clone(),
            other => panic!("unexpected source: {:?}", other),
        }
    }

    fn fingerprint(topology: &Topology) -> String {
        let web = service("web");
        BuildContext::collect(&web, &recipe(topology))
            .unwrap()
            .fingerprint(&web)
            .unwrap()
    }

    #[test]
    fn renders_dockerfile() {
        let dir = project();
        let rendered = render_dockerfile(&recipe(&topology(dir.path())));
        assert_eq!(
            rendered,
            "# Generated by berth.\nFROM python:3.12-slim\nWORKDIR /app\nCOPY requirements.txt requirements.txt\nRUN pip install -r requirements.txt\nCOPY . .\nRUN python manage.py collectstatic --noinput\n"
        );
    }

    #[test]
    fn fingerprint_tracks_content() {
        let dir = project();
        let topology = topology(dir.path());
        let original = fingerprint(&topology);
        assert_eq!(original.len(), 64);
        assert_eq!(fingerprint(&topology), original);

        // Repository metadata is not part of the image.
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/other\n").unwrap();
        assert_eq!(fingerprint(&topology), original);

        std::fs::write(dir.path().join("requirements.txt"), "django==5.1\n").unwrap();
        let manifest_changed = fingerprint(&topology);
        assert_ne!(manifest_changed, original);

        std::fs::write(dir.path().join("store/views.py"), "def index(): pass\n").unwrap();
        assert_ne!(fingerprint(&topology), manifest_changed);
    }

    #[test]
    fn archive_contains_context_and_dockerfile() {
        let dir = project();
        let topology = topology(dir.path());
        let web = service("web");
        let context = BuildContext::collect(&web, &recipe(&topology)).unwrap();
        let bytes = context.archive(&web).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names = Vec::new();
        let mut dockerfile = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == DOCKERFILE_NAME {
                entry.read_to_string(&mut dockerfile).unwrap();
            }
            names.push(name);
        }

        assert_eq!(
            names,
            vec![
                "manage.py",
                "requirements.txt",
                "store/settings.py",
                DOCKERFILE_NAME
            ]
        );
        assert!(dockerfile.ends_with(&format!("RUN {}\n", PREPARE)));
    }

    #[tokio::test]
    async fn shared_recipe_builds_once_then_caches() {
        let dir = project();
        let topology = topology(dir.path());
        let runtime = ScriptedRuntime::new();
        let builder = ImageBuilder::new(&runtime, topology.project());

        let resolved = builder.resolve(&topology, BuildPolicy::Missing).await.unwrap();
        let tag = resolved.image_for("web").unwrap().to_string();
        assert!(tag.starts_with("store-web:"));
        assert_eq!(tag.len(), "store-web:".len() + TAG_FINGERPRINT_LEN);
        assert_eq!(resolved.image_for("worker"), Some(tag.as_str()));
        assert_eq!(resolved.image_for("redis"), Some("redis:7"));
        assert_eq!(resolved.builds().len(), 1);
        assert_eq!(resolved.builds()[0].status, BuildStatus::Built);
        assert_eq!(resolved.builds()[0].services, vec![service("web"), service("worker")]);

        let again = builder.resolve(&topology, BuildPolicy::Never).await.unwrap();
        assert_eq!(again.builds()[0].status, BuildStatus::Cached);
        assert_eq!(again.image_for("web"), Some(tag.as_str()));

        assert_eq!(runtime.calls(), vec![RuntimeCall::Build(tag)]);
    }

    #[tokio::test]
    async fn failed_preparation_fails_the_build() {
        let dir = project();
        let topology = topology(dir.path());
        let runtime = ScriptedRuntime::new().with_build_error(&format!(
            "The command '/bin/sh -c {}' returned a non-zero code: 1",
            PREPARE
        ));

        let err = ImageBuilder::new(&runtime, topology.project())
            .resolve(&topology, BuildPolicy::Missing)
            .await
            .unwrap_err();
        match err {
            BuildError::PreparationFailed { service: failed, command, .. } => {
                assert_eq!(failed, service("web"));
                assert_eq!(command, PREPARE);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let fingerprint = fingerprint(&topology);
        let tag = format!("store-web:{}", &fingerprint[..TAG_FINGERPRINT_LEN]);
        assert!(!runtime.has_image(&tag));
    }

    #[tokio::test]
    async fn other_build_failures() {
        let dir = project();
        let topology = topology(dir.path());
        let runtime = ScriptedRuntime::new().with_build_error("failed to pull python:3.12-slim");

        let err = ImageBuilder::new(&runtime, topology.project())
            .resolve(&topology, BuildPolicy::Missing)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::BuildFailed { .. }));
    }

    #[tokio::test]
    async fn never_policy_requires_existing_image() {
        let dir = project();
        let topology = topology(dir.path());
        let runtime = ScriptedRuntime::new();

        let err = ImageBuilder::new(&runtime, topology.project())
            .resolve(&topology, BuildPolicy::Never)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ImageMissing { .. }));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_sources() {
        let dir = project();
        let topology = topology(dir.path());
        std::fs::remove_file(dir.path().join("requirements.txt")).unwrap();

        let runtime = ScriptedRuntime::new();
        let err = ImageBuilder::new(&runtime, topology.project())
            .resolve(&topology, BuildPolicy::Missing)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingManifest { .. }));

        drop(dir);
        let err = ImageBuilder::new(&runtime, topology.project())
            .resolve(&topology, BuildPolicy::Missing)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingContext { .. }));
    }

    #[tokio::test]
    async fn custom_dockerfile_gets_preparation_step() {
        let dir = project();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.12\nCOPY . /srv").unwrap();
        let topology = TopologyLoader::load_str(
            "name: store\nservices:\n  web:\n    build:\n      context: .\n      dockerfile: Dockerfile\n      prepare: make assets\n",
            dir.path(),
        )
        .unwrap();
        let recipe = match &topology.service("web").unwrap().source {
            ServiceSource::Build(recipe) => recipe.clone(),
            other => panic!("unexpected source: {:?}", other),
        };

        let context = BuildContext::collect(&service("web"), &recipe).unwrap();
        assert_eq!(context.dockerfile, "FROM python:3.12\nCOPY . /srv\nRUN make assets\n");
    }
}
