//! Named volume management.
//!
//! Volumes hold state that must survive restarts, rebuilds, and re-activations, so nothing in here removes a volume
//! implicitly. The only way to remove one is [`VolumeManager::remove`], which backs explicit administrative commands.

use berth_error::GenericError;
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info};

use crate::{
    events::{ActivationEvent, EventSink},
    runtime::{volume_name, ContainerRuntime, VolumeInfo, VolumeSpec},
    topology::Topology,
};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum VolumeError {
    #[snafu(display("Volume '{}' does not exist.", volume))]
    NotFound { volume: String },

    #[snafu(display("Volume '{}' is still in use by {}.", volume, instances.join(", ")))]
    InUse { volume: String, instances: Vec<String> },

    #[snafu(display("Container runtime error while managing volume '{}'.", volume))]
    Runtime { volume: String, source: GenericError },
}

/// Whether an ensured volume had to be created.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Created,
    Existing,
}

/// Manages the named volumes of a single project.
pub struct VolumeManager<'a, R: ?Sized> {
    runtime: &'a R,
    project: &'a str,
    events: EventSink,
}

impl<'a, R> VolumeManager<'a, R>
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

    /// Makes sure every volume declared by `topology` exists, creating the missing ones.
    ///
    /// Existing volumes are left untouched, contents included.
    pub async fn ensure_all(&self, topology: &Topology) -> Result<Vec<(String, VolumeStatus)>, VolumeError> {
        let mut ensured = Vec::new();
        for volume in topology.volumes() {
            let spec = VolumeSpec::for_volume(self.project, volume);
            let status = self.ensure(&spec).await?;
            ensured.push((spec.name, status));
        }
        Ok(ensured)
    }

    async fn ensure(&self, spec: &VolumeSpec) -> Result<VolumeStatus, VolumeError> {
        let existing = self.runtime.inspect_volume(&spec.name).await.context(Runtime {
            volume: spec.name.clone(),
        })?;

        let status = if existing.is_some() {
            debug!(project = self.project, volume = %spec.name, "Volume already exists.");
            VolumeStatus::Existing
        } else {
            self.runtime.create_volume(spec).await.context(Runtime {
                volume: spec.name.clone(),
            })?;
            info!(project = self.project, volume = %spec.name, driver = %spec.driver, "Created volume.");
            VolumeStatus::Created
        };

        self.events.emit(ActivationEvent::VolumeEnsured {
            volume: spec.name.clone(),
            created: status == VolumeStatus::Created,
        });
        Ok(status)
    }

    /// Lists the project's volumes.
    pub async fn list(&self) -> Result<Vec<VolumeInfo>, VolumeError> {
        self.runtime.list_volumes(self.project).await.context(Runtime {
            volume: format!("{}_*", self.project),
        })
    }

    /// Removes volumes of this project, by their unscoped names.
    ///
    /// Every volume is checked before any is removed: if one doesn't exist or is mounted by an instance of the project
    /// (running or not), nothing is removed.
    pub async fn remove(&self, volumes: &[String]) -> Result<Vec<String>, VolumeError> {
        let instances = self.runtime.list_instances(self.project).await.context(Runtime {
            volume: format!("{}_*", self.project),
        })?;

        let mut scoped = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let name = volume_name(self.project, volume);
            let exists = self.runtime.inspect_volume(&name).await.context(Runtime { volume: name.clone() })?;
            if exists.is_none() {
                return Err(VolumeError::NotFound { volume: name });
            }

            let users = instances
                .iter()
                .filter(|instance| instance.volumes.contains(&name))
                .map(|instance| instance.handle.name.clone())
                .collect::<Vec<_>>();
            if !users.is_empty() {
                return Err(VolumeError::InUse {
                    volume: name,
                    instances: users,
                });
            }

            scoped.push(name);
        }

        for name in &scoped {
            self.runtime
                .remove_volume(name)
                .await
                .context(Runtime { volume: name.clone() })?;
            info!(project = self.project, volume = %name, "Removed volume.");
        }

        Ok(scoped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::create_event_channel,
        runtime::LaunchSpec,
        test_util::{RuntimeCall, ScriptedRuntime},
        topology::TopologyLoader,
    };

    fn topology() -> (tempfile::TempDir, Topology) {
        let dir = tempfile::tempdir().unwrap();
        let topology = TopologyLoader::load_str(
            "name: shop\nvolumes:\n  pgdata:\n  cache:\nservices:\n  db:\n    image: postgres\n    volumes: [\"pgdata:/data\"]\n  redis:\n    image: redis\n    volumes: [\"cache:/data\"]\n",
            dir.path(),
        )
        .unwrap();
        (dir, topology)
    }

    #[tokio::test]
    async fn creates_only_missing_volumes() {
        let (_dir, topology) = topology();
        let runtime = ScriptedRuntime::new().with_existing_volume("shop_pgdata");
        let (events, mut rx) = create_event_channel();

        let ensured = VolumeManager::new(&runtime, topology.project())
            .with_events(events)
            .ensure_all(&topology)
            .await
            .unwrap();

        assert_eq!(
            ensured,
            vec![
                ("shop_pgdata".to_string(), VolumeStatus::Existing),
                ("shop_cache".to_string(), VolumeStatus::Created),
            ]
        );
        assert_eq!(runtime.calls(), vec![RuntimeCall::CreateVolume("shop_cache".to_string())]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ActivationEvent::VolumeEnsured {
                volume: "shop_pgdata".to_string(),
                created: false
            }
        );
    }

    #[tokio::test]
    async fn ensuring_twice_never_recreates() {
        let (_dir, topology) = topology();
        let runtime = ScriptedRuntime::new();
        let manager = VolumeManager::new(&runtime, topology.project());

        manager.ensure_all(&topology).await.unwrap();
        let second = manager.ensure_all(&topology).await.unwrap();

        assert!(second.iter().all(|(_, status)| *status == VolumeStatus::Existing));
        assert!(!runtime
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::RemoveVolume(_))));
        assert_eq!(runtime.volume_names(), vec!["shop_pgdata", "shop_cache"]);
    }

    #[tokio::test]
    async fn lists_project_volumes() {
        let (_dir, topology) = topology();
        let runtime = ScriptedRuntime::new().with_existing_volume("unrelated");
        let manager = VolumeManager::new(&runtime, topology.project());
        manager.ensure_all(&topology).await.unwrap();

        let listed = manager.list().await.unwrap();
        let names = listed.iter().map(|v| v.volume.as_deref()).collect::<Vec<_>>();
        assert_eq!(names, vec![Some("pgdata"), Some("cache")]);
    }

    #[tokio::test]
    async fn remove_refuses_mounted_volumes() {
        let (_dir, topology) = topology();
        let runtime = ScriptedRuntime::new();
        let manager = VolumeManager::new(&runtime, topology.project());
        manager.ensure_all(&topology).await.unwrap();

        let db = topology.service("db").unwrap();
        runtime
            .launch(&LaunchSpec::for_service(topology.project(), db, "postgres"))
            .await
            .unwrap();

        let err = manager
            .remove(&["cache".to_string(), "pgdata".to_string()])
            .await
            .unwrap_err();
        match err {
            VolumeError::InUse { volume, instances } => {
                assert_eq!(volume, "shop_pgdata");
                assert_eq!(instances, vec!["shop-db"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Nothing was removed, not even the unmounted volume checked first.
        assert_eq!(runtime.volume_names(), vec!["shop_pgdata", "shop_cache"]);

        let removed = manager.remove(&["cache".to_string()]).await.unwrap();
        assert_eq!(removed, vec!["shop_cache"]);
        assert_eq!(runtime.volume_names(), vec!["shop_pgdata"]);

        assert!(matches!(
            manager.remove(&["cache".to_string()]).await,
            Err(VolumeError::NotFound { .. })
        ));
    }
}
