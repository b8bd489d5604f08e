//! Activation and shutdown of a topology.
//!
//! Activation runs on a single task: launches and probe loops are futures polled from one `FuturesUnordered`, and every
//! state transition happens in the loop that drains it. A service is launched once all of its dependencies are ready,
//! so services with no dependency relation between them launch and probe concurrently, while a dependent always
//! launches strictly after each of its dependencies became ready.

use std::time::Duration;

use berth_error::{generic_error, ErrorContext as _, ExitStatus, GenericError};
use futures::{
    future::{FutureExt as _, LocalBoxFuture},
    stream::{FuturesUnordered, StreamExt as _},
};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    build::ResolvedImages,
    events::{ActivationEvent, EventSink},
    readiness::{await_ready, ProbeSummary, ReadinessError, ReadinessState},
    runtime::{ContainerRuntime, InstanceHandle, LaunchSpec},
    topology::{ServiceName, Topology},
    volumes::VolumeManager,
};

/// Default time a stopping instance is given to exit before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How a service's activation ended.
#[derive(Debug)]
pub enum ServiceOutcome {
    /// The service became ready.
    Ready,

    /// The service failed to launch, or never became ready.
    Failed { error: ReadinessError },

    /// The service was never launched because a dependency failed.
    Skipped { blocked_by: ServiceName },

    /// Activation was cancelled before the service became ready.
    Cancelled,
}

/// Activation result of a single service.
#[derive(Debug)]
pub struct ServiceReport {
    pub service: ServiceName,
    pub state: ReadinessState,
    pub outcome: ServiceOutcome,

    /// Whether readiness was established by a probe rather than by the launch alone.
    pub probed: bool,

    /// Number of probes run.
    pub attempts: u32,

    /// Time spent probing.
    pub elapsed: Duration,
}

/// Aggregated result of activating a topology.
#[derive(Debug)]
pub struct ActivationReport {
    pub project: String,

    /// Per-service results, in activation order.
    pub services: Vec<ServiceReport>,

    /// Services in the order their instances came up.
    pub launch_order: Vec<ServiceName>,

    /// Every instance that was launched, whether or not it became ready.
    pub instances: Vec<InstanceHandle>,
}

impl ActivationReport {
    /// Returns `true` if every service became ready.
    pub fn is_success(&self) -> bool {
        self.services
            .iter()
            .all(|report| matches!(report.outcome, ServiceOutcome::Ready))
    }

    /// Errors of the services that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ReadinessError> {
        self.services.iter().filter_map(|report| match &report.outcome {
            ServiceOutcome::Failed { error } => Some(error),
            _ => None,
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|report| report.service.as_str() == name)
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.is_success() {
            ExitStatus::Success
        } else {
            ExitStatus::ReadinessFailure
        }
    }
}

/// How stopping a service ended.
#[derive(Debug)]
pub enum StopOutcome {
    Stopped,

    /// The instance could not be stopped.
    Failed { error: GenericError },

    /// The instance was left running because a service depending on it failed to stop.
    Held { dependent: ServiceName },
}

/// Shutdown result of a single instance.
#[derive(Debug)]
pub struct StopReport {
    pub service: ServiceName,
    pub instance: String,
    pub outcome: StopOutcome,

    /// Whether the instance belongs to a service no longer in the topology.
    pub orphan: bool,
}

/// Aggregated result of shutting down a topology.
#[derive(Debug)]
pub struct ShutdownReport {
    pub project: String,

    /// Per-instance results, in the order they were handled.
    pub instances: Vec<StopReport>,

    pub network_removed: bool,
}

impl ShutdownReport {
    pub fn is_success(&self) -> bool {
        self.instances
            .iter()
            .all(|report| matches!(report.outcome, StopOutcome::Stopped))
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.is_success() {
            ExitStatus::Success
        } else {
            ExitStatus::Fatal
        }
    }
}

enum Step {
    Launched {
        service: ServiceName,
        result: Result<InstanceHandle, GenericError>,
    },
    Probed {
        service: ServiceName,
        result: Result<ProbeSummary, ReadinessError>,
    },
}

enum Phase {
    Waiting,
    InFlight,
    Done(ServiceOutcome),
}

struct Tracker {
    state: ReadinessState,
    phase: Phase,
    probed: bool,
    attempts: u32,
    elapsed: Duration,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: ReadinessState::Starting,
            phase: Phase::Waiting,
            probed: false,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Done(ServiceOutcome::Ready))
    }

    fn transition(&mut self, service: &ServiceName, next: ReadinessState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            warn!(service = %service, from = ?self.state, to = ?next, "Ignoring invalid readiness transition.");
        }
    }
}

/// Brings topologies up and tears them down.
pub struct Orchestrator<'a, R: ?Sized> {
    runtime: &'a R,
    events: EventSink,
    stop_timeout: Duration,
    cancel: CancellationToken,
}

impl<'a, R> Orchestrator<'a, R>
where
    R: ContainerRuntime + ?Sized,
{
    pub fn new(runtime: &'a R) -> Self {
        Self {
            runtime,
            events: EventSink::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Sets the token that interrupts an activation in progress.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Activates `topology`, running each service with its image from `images`.
    ///
    /// The project network and every declared volume are ensured before the first launch. Services are then launched
    /// in dependency order and probed until ready. A service without a readiness probe is considered ready as soon as
    /// its instance is running: that only says the process started, not that it is able to serve.
    ///
    /// A service that fails to launch or never becomes ready fails on its own: its not-yet-launched transitive
    /// dependents are skipped, and unrelated services continue to activate. Instances are left running either way; see
    /// [`shutdown`][Self::shutdown].
    ///
    /// # Errors
    ///
    /// If the network or a volume cannot be ensured, an error will be returned and nothing is launched. Failures of
    /// individual services are reported in the returned [`ActivationReport`] instead.
    pub async fn activate(&self, topology: &Topology, images: &ResolvedImages) -> Result<ActivationReport, GenericError> {
        let project = topology.project();

        self.runtime
            .ensure_network(project)
            .await
            .with_error_context(|| format!("Failed to create network for project '{}'.", project))?;
        VolumeManager::new(self.runtime, project)
            .with_events(self.events.clone())
            .ensure_all(topology)
            .await
            .error_context("Failed to ensure project volumes.")?;

        let mut trackers = topology
            .activation_order()
            .iter()
            .map(|service| (service.clone(), Tracker::new()))
            .collect::<IndexMap<_, _>>();
        let mut in_flight: FuturesUnordered<LocalBoxFuture<'_, Step>> = FuturesUnordered::new();
        let mut launch_order = Vec::new();
        let mut instances = Vec::new();

        info!(project, services = trackers.len(), "Activating topology.");
        self.launch_eligible(topology, images, &mut trackers, &mut in_flight);

        while !in_flight.is_empty() {
            let step = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    warn!(project, "Activation cancelled.");
                    for (service, tracker) in trackers.iter_mut() {
                        if !matches!(tracker.phase, Phase::Done(_)) {
                            tracker.phase = Phase::Done(ServiceOutcome::Cancelled);
                            self.events.emit(ActivationEvent::Cancelled { service: service.clone() });
                        }
                    }
                    break;
                },
                Some(step) = in_flight.next() => step,
            };

            match step {
                Step::Launched { service, result } => match result {
                    Ok(handle) => {
                        launch_order.push(service.clone());
                        instances.push(handle.clone());
                        self.on_launched(topology, &mut trackers, &mut in_flight, service, handle);
                    }
                    Err(e) => {
                        let error = ReadinessError::LaunchFailed {
                            service: service.clone(),
                            source: e,
                        };
                        self.fail(topology, &mut trackers, error);
                    }
                },
                Step::Probed { service, result } => match result {
                    Ok(summary) => {
                        if let Some(tracker) = trackers.get_mut(&service) {
                            tracker.transition(&service, ReadinessState::Ready);
                            tracker.attempts = summary.attempts;
                            tracker.elapsed = summary.elapsed;
                            tracker.phase = Phase::Done(ServiceOutcome::Ready);
                        }
                        self.events.emit(ActivationEvent::Ready {
                            service,
                            attempts: summary.attempts,
                            elapsed: summary.elapsed,
                        });
                    }
                    Err(error) => self.fail(topology, &mut trackers, error),
                },
            }

            self.launch_eligible(topology, images, &mut trackers, &mut in_flight);
        }

        let services = trackers
            .into_iter()
            .map(|(service, tracker)| {
                let outcome = match tracker.phase {
                    Phase::Done(outcome) => outcome,
                    // Only reachable if nothing is left to run for a service whose dependencies never settled.
                    Phase::Waiting | Phase::InFlight => ServiceOutcome::Cancelled,
                };
                ServiceReport {
                    service,
                    state: tracker.state,
                    outcome,
                    probed: tracker.probed,
                    attempts: tracker.attempts,
                    elapsed: tracker.elapsed,
                }
            })
            .collect::<Vec<_>>();

        let report = ActivationReport {
            project: project.to_string(),
            services,
            launch_order,
            instances,
        };
        if report.is_success() {
            info!(project, "Every service is ready.");
        } else {
            warn!(project, failed = report.failures().count(), "Topology activation did not complete.");
        }

        Ok(report)
    }

    /// Launches every waiting service whose dependencies are all ready.
    fn launch_eligible<'f>(
        &'f self, topology: &'f Topology, images: &ResolvedImages, trackers: &mut IndexMap<ServiceName, Tracker>,
        in_flight: &mut FuturesUnordered<LocalBoxFuture<'f, Step>>,
    ) {
        for service in topology.activation_order() {
            let waiting = trackers
                .get(service)
                .is_some_and(|tracker| matches!(tracker.phase, Phase::Waiting));
            if !waiting {
                continue;
            }

            let dependencies_ready = topology
                .graph()
                .dependencies(service)
                .all(|dependency| trackers.get(dependency).is_some_and(Tracker::is_ready));
            if !dependencies_ready {
                continue;
            }

            let Some(definition) = topology.service(service) else {
                continue;
            };
            let Some(image) = images.image_for(service) else {
                let error = ReadinessError::LaunchFailed {
                    service: service.clone(),
                    source: generic_error!("No image was resolved for service '{}'.", service),
                };
                self.fail(topology, trackers, error);
                continue;
            };

            if let Some(tracker) = trackers.get_mut(service) {
                tracker.phase = Phase::InFlight;
            }

            debug!(service = %service, image, "Dependencies ready. Launching service.");
            self.events.emit(ActivationEvent::Launching {
                service: service.clone(),
            });

            let spec = LaunchSpec::for_service(topology.project(), definition, image);
            let runtime = self.runtime;
            let service = service.clone();
            in_flight.push(
                async move {
                    let result = runtime.launch(&spec).await;
                    Step::Launched { service, result }
                }
                .boxed_local(),
            );
        }
    }

    fn on_launched<'f>(
        &'f self, topology: &'f Topology, trackers: &mut IndexMap<ServiceName, Tracker>,
        in_flight: &mut FuturesUnordered<LocalBoxFuture<'f, Step>>, service: ServiceName, handle: InstanceHandle,
    ) {
        let Some(tracker) = trackers.get_mut(&service) else {
            return;
        };
        tracker.transition(&service, ReadinessState::Probing);

        match topology.service(&service).and_then(|definition| definition.readiness.as_ref()) {
            Some(probe) => {
                info!(service = %service, instance = %handle.name, "Service launched. Probing readiness.");
                tracker.probed = true;
                self.events.emit(ActivationEvent::Probing {
                    service: service.clone(),
                });

                let runtime = self.runtime;
                let events = self.events.clone();
                in_flight.push(
                    async move {
                        let result = await_ready(runtime, &handle, probe, &events).await;
                        Step::Probed { service, result }
                    }
                    .boxed_local(),
                );
            }
            None => {
                info!(
                    service = %service,
                    instance = %handle.name,
                    "Service launched without a readiness probe. Treating the running process as ready."
                );
                tracker.transition(&service, ReadinessState::Ready);
                tracker.phase = Phase::Done(ServiceOutcome::Ready);
                self.events.emit(ActivationEvent::Ready {
                    service,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                });
            }
        }
    }

    /// Marks a service as failed, and skips every transitive dependent that hasn't been launched yet.
    fn fail(&self, topology: &Topology, trackers: &mut IndexMap<ServiceName, Tracker>, error: ReadinessError) {
        let service = error.service().clone();
        error!(service = %service, error = %error, "Service failed.");
        self.events.emit(ActivationEvent::Failed {
            service: service.clone(),
            error: error.to_string(),
        });

        for dependent in topology.graph().transitive_dependents(&service) {
            let Some(tracker) = trackers.get_mut(&dependent) else {
                continue;
            };
            if matches!(tracker.phase, Phase::Waiting) {
                warn!(service = %dependent, blocked_by = %service, "Skipping service with a failed dependency.");
                tracker.phase = Phase::Done(ServiceOutcome::Skipped {
                    blocked_by: service.clone(),
                });
                self.events.emit(ActivationEvent::Skipped {
                    service: dependent,
                    blocked_by: service.clone(),
                });
            }
        }

        if let Some(tracker) = trackers.get_mut(&service) {
            tracker.transition(&service, ReadinessState::Failed);
            if let ReadinessError::ReadinessTimeout { attempts, elapsed, .. } = &error {
                tracker.attempts = *attempts;
                tracker.elapsed = *elapsed;
            }
            tracker.phase = Phase::Done(ServiceOutcome::Failed { error });
        }
    }

    /// Stops every instance of the project, dependents before their dependencies.
    ///
    /// Instances of services that are no longer part of `topology` are stopped first. The remaining instances are
    /// stopped one at a time, in reverse activation order. When an instance fails to stop, everything it depends on is
    /// held: left running, and reported as such. The project network is only removed once every instance stopped.
    /// Volumes are never removed.
    ///
    /// # Errors
    ///
    /// If the project's instances cannot be listed, an error will be returned.
    pub async fn shutdown(&self, topology: &Topology) -> Result<ShutdownReport, GenericError> {
        let project = topology.project();
        let listed = self
            .runtime
            .list_instances(project)
            .await
            .with_error_context(|| format!("Failed to list instances of project '{}'.", project))?;

        let mut running = IndexMap::new();
        let mut reports = Vec::new();
        for instance in listed {
            if topology.service(&instance.handle.service).is_some() {
                running.insert(instance.handle.service.clone(), instance.handle);
            } else {
                info!(service = %instance.handle.service, instance = %instance.handle.name, "Stopping orphaned instance.");
                let outcome = self.stop(&instance.handle).await;
                reports.push(StopReport {
                    service: instance.handle.service.clone(),
                    instance: instance.handle.name,
                    outcome,
                    orphan: true,
                });
            }
        }

        let mut held: IndexMap<ServiceName, ServiceName> = IndexMap::new();
        for service in topology.activation_order().iter().rev() {
            let Some(handle) = running.shift_remove(service) else {
                continue;
            };

            let outcome = match held.get(service) {
                Some(dependent) => {
                    warn!(service = %service, dependent = %dependent, "Leaving service running: a dependent failed to stop.");
                    self.events.emit(ActivationEvent::Held {
                        service: service.clone(),
                        dependent: dependent.clone(),
                    });
                    StopOutcome::Held {
                        dependent: dependent.clone(),
                    }
                }
                None => self.stop(&handle).await,
            };

            if !matches!(outcome, StopOutcome::Stopped) {
                for dependency in topology.graph().transitive_dependencies(service) {
                    held.entry(dependency).or_insert_with(|| service.clone());
                }
            }

            reports.push(StopReport {
                service: service.clone(),
                instance: handle.name,
                outcome,
                orphan: false,
            });
        }

        let mut report = ShutdownReport {
            project: project.to_string(),
            instances: reports,
            network_removed: false,
        };

        if report.is_success() {
            match self.runtime.remove_network(project).await {
                Ok(()) => report.network_removed = true,
                Err(e) => warn!(project, error = %e, "Failed to remove project network."),
            }
        } else {
            warn!(project, "Not every instance stopped. Leaving project network in place.");
        }

        Ok(report)
    }

    async fn stop(&self, handle: &InstanceHandle) -> StopOutcome {
        self.events.emit(ActivationEvent::Stopping {
            service: handle.service.clone(),
        });

        match self.runtime.stop(handle, self.stop_timeout).await {
            Ok(()) => {
                info!(service = %handle.service, instance = %handle.name, "Stopped service.");
                self.events.emit(ActivationEvent::Stopped {
                    service: handle.service.clone(),
                });
                StopOutcome::Stopped
            }
            Err(e) => {
                error!(service = %handle.service, instance = %handle.name, error = %e, "Failed to stop service.");
                self.events.emit(ActivationEvent::StopFailed {
                    service: handle.service.clone(),
                    error: format!("{:#}", e),
                });
                StopOutcome::Failed { error: e }
            }
        }
    }
}
