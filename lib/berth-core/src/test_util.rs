use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use berth_error::{generic_error, GenericError};
use indexmap::IndexMap;
use tokio::time::{sleep, Instant};

use crate::{
    runtime::{
        BuildRequest, ContainerRuntime, InstanceHandle, InstanceInfo, LaunchSpec, RuntimeMount, VolumeInfo, VolumeSpec,
    },
    topology::{ProbeCheck, ServiceName},
};

/// How a scripted service behaves.
#[derive(Clone, Debug, Default)]
pub struct ServiceScript {
    launch_delay: Duration,
    launch_error: Option<String>,
    /// Number of failed probes before the first successful one. `None` never succeeds.
    probe_failures: Option<u32>,
    probe_delay: Duration,
    stop_error: Option<String>,
}

impl ServiceScript {
    pub fn ready_after(failures: u32) -> Self {
        Self {
            probe_failures: Some(failures),
            ..Default::default()
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn launch_fails(message: &str) -> Self {
        Self {
            launch_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn with_stop_error(mut self, message: &str) -> Self {
        self.stop_error = Some(message.to_string());
        self
    }
}

/// A runtime call, as recorded by [`ScriptedRuntime`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeCall {
    EnsureNetwork,
    RemoveNetwork,
    CreateVolume(String),
    RemoveVolume(String),
    Build(String),
    Launch(String),
    Probe(String),
    Stop(String),
}

#[derive(Default)]
struct State {
    timeline: Vec<(Duration, RuntimeCall)>,
    probes: HashMap<String, u32>,
    volumes: IndexMap<String, VolumeSpec>,
    images: HashSet<String>,
    instances: IndexMap<String, InstanceInfo>,
    build_error: Option<String>,
}

/// An in-memory runtime whose services behave according to per-service scripts.
///
/// Every call is recorded on a timeline, relative to the runtime's creation, so tests can assert on both ordering and
/// timing. Services without a script launch instantly and are ready on the first probe.
pub struct ScriptedRuntime {
    started: Instant,
    scripts: HashMap<String, ServiceScript>,
    state: Mutex<State>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            scripts: HashMap::new(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_service(mut self, service: &str, script: ServiceScript) -> Self {
        self.scripts.insert(service.to_string(), script);
        self
    }

    pub fn with_existing_volume(self, name: &str) -> Self {
        self.state.lock().unwrap().volumes.insert(
            name.to_string(),
            VolumeSpec {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: IndexMap::new(),
            },
        );
        self
    }

    pub fn with_build_error(self, message: &str) -> Self {
        self.state.lock().unwrap().build_error = Some(message.to_string());
        self
    }

    pub fn timeline(&self) -> Vec<(Duration, RuntimeCall)> {
        self.state.lock().unwrap().timeline.clone()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.timeline().into_iter().map(|(_, call)| call).collect()
    }

    /// Services in the order they were launched.
    pub fn launch_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Launch(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Services in the order they were stopped.
    pub fn stop_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Stop(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Time at which `call` was first recorded.
    pub fn time_of(&self, call: &RuntimeCall) -> Option<Duration> {
        self.timeline()
            .into_iter()
            .find(|(_, recorded)| recorded == call)
            .map(|(at, _)| at)
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().unwrap().volumes.keys().cloned().collect()
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.state.lock().unwrap().images.contains(tag)
    }

    fn script(&self, service: &str) -> ServiceScript {
        self.scripts
            .get(service)
            .cloned()
            .unwrap_or_else(|| ServiceScript::ready_after(0))
    }

    fn record(&self, call: RuntimeCall) {
        let at = self.started.elapsed();
        self.state.lock().unwrap().timeline.push((at, call));
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ensure_network(&self, _project: &str) -> Result<(), GenericError> {
        self.record(RuntimeCall::EnsureNetwork);
        Ok(())
    }

    async fn remove_network(&self, _project: &str) -> Result<(), GenericError> {
        self.record(RuntimeCall::RemoveNetwork);
        Ok(())
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>, GenericError> {
        let state = self.state.lock().unwrap();
        Ok(state.volumes.get(name).map(|spec| VolumeInfo {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            volume: None,
        }))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), GenericError> {
        self.record(RuntimeCall::CreateVolume(spec.name.clone()));
        self.state.lock().unwrap().volumes.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn list_volumes(&self, project: &str) -> Result<Vec<VolumeInfo>, GenericError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .values()
            .filter(|spec| spec.labels.get(crate::runtime::LABEL_PROJECT).map(String::as_str) == Some(project))
            .map(|spec| VolumeInfo {
                name: spec.name.clone(),
                driver: spec.driver.clone(),
                volume: spec.labels.get(crate::runtime::LABEL_VOLUME).cloned(),
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), GenericError> {
        self.record(RuntimeCall::RemoveVolume(name.to_string()));
        match self.state.lock().unwrap().volumes.shift_remove(name) {
            Some(_) => Ok(()),
            None => Err(generic_error!("no such volume: {}", name)),
        }
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, GenericError> {
        Ok(self.state.lock().unwrap().images.contains(tag))
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<(), GenericError> {
        self.record(RuntimeCall::Build(request.tag.clone()));
        let mut state = self.state.lock().unwrap();
        match &state.build_error {
            Some(message) => Err(generic_error!("{}", message)),
            None => {
                state.images.insert(request.tag.clone());
                Ok(())
            }
        }
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<InstanceHandle, GenericError> {
        let script = self.script(&spec.service);
        if !script.launch_delay.is_zero() {
            sleep(script.launch_delay).await;
        }
        self.record(RuntimeCall::Launch(spec.service.to_string()));

        if let Some(message) = script.launch_error {
            return Err(generic_error!("{}", message));
        }

        let handle = InstanceHandle {
            service: spec.service.clone(),
            id: format!("{}-id", spec.instance_name),
            name: spec.instance_name.clone(),
            ports: spec.ports.clone(),
        };
        let volumes = spec
            .mounts
            .iter()
            .filter_map(|mount| match mount {
                RuntimeMount::Volume { name, .. } => Some(name.clone()),
                RuntimeMount::Bind { .. } => None,
            })
            .collect();
        self.state.lock().unwrap().instances.insert(
            spec.instance_name.clone(),
            InstanceInfo {
                handle: handle.clone(),
                image: spec.image.clone(),
                status: "running".to_string(),
                running: true,
                volumes,
            },
        );
        Ok(handle)
    }

    async fn probe(&self, instance: &InstanceHandle, _check: &ProbeCheck) -> Result<(), GenericError> {
        let service = instance.service.to_string();
        let script = self.script(&service);
        self.record(RuntimeCall::Probe(service.clone()));
        if !script.probe_delay.is_zero() {
            sleep(script.probe_delay).await;
        }

        let failed_so_far = {
            let mut state = self.state.lock().unwrap();
            let count = state.probes.entry(service.clone()).or_default();
            let current = *count;
            *count += 1;
            current
        };

        match script.probe_failures {
            Some(failures) if failed_so_far >= failures => Ok(()),
            _ => Err(generic_error!("{}: connection refused", service)),
        }
    }

    async fn stop(&self, instance: &InstanceHandle, _timeout: Duration) -> Result<(), GenericError> {
        let service = instance.service.to_string();
        self.record(RuntimeCall::Stop(service.clone()));

        if let Some(message) = self.script(&service).stop_error {
            return Err(generic_error!("{}", message));
        }

        self.state.lock().unwrap().instances.shift_remove(&instance.name);
        Ok(())
    }

    async fn list_instances(&self, _project: &str) -> Result<Vec<InstanceInfo>, GenericError> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }
}

pub fn service(name: &str) -> ServiceName {
    ServiceName::try_from(name).unwrap()
}
