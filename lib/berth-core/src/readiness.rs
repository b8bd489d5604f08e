//! Readiness tracking and probing.

use std::time::Duration;

use berth_error::GenericError;
use serde::Serialize;
use snafu::Snafu;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::{
    events::{ActivationEvent, EventSink},
    runtime::{ContainerRuntime, InstanceHandle},
    topology::{ReadinessProbe, ServiceName},
};

/// Readiness of a single service instance.
///
/// Every instance starts in `Starting`. Once launched, it moves to `Probing`, and from there to either `Ready` or
/// `Failed`. An instance that fails to launch goes straight from `Starting` to `Failed`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Starting,
    Probing,
    Ready,
    Failed,
}

impl ReadinessState {
    /// Returns `true` if moving from this state to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Probing) | (Self::Starting, Self::Failed) | (Self::Probing, Self::Ready | Self::Failed)
        )
    }
}

/// A readiness error.
///
/// Readiness errors are isolated to the service they occur in: they fail that service and block its dependents, but
/// never abort activation of unrelated services.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ReadinessError {
    #[snafu(display("Failed to launch '{}': {:#}", service, source))]
    LaunchFailed { service: ServiceName, source: GenericError },

    #[snafu(display(
        "'{}' was not ready after {} probe(s) over {:?}; last error: {}",
        service,
        attempts,
        elapsed,
        last_error
    ))]
    ReadinessTimeout {
        service: ServiceName,
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
}

impl ReadinessError {
    pub fn service(&self) -> &ServiceName {
        match self {
            Self::LaunchFailed { service, .. } | Self::ReadinessTimeout { service, .. } => service,
        }
    }
}

/// Outcome of a successful probe loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProbeSummary {
    /// Number of probes run, including the successful one.
    pub attempts: u32,
    /// Time from the start of the probe loop until the successful probe returned.
    pub elapsed: Duration,
}

/// Probes `instance` until it reports ready or the retry budget is spent.
///
/// After waiting out the probe's start period, a probe is run immediately and then once per interval. Each probe is
/// bounded by the probe timeout, and a probe that times out counts as a failure. The loop gives up after `retries`
/// failed probes, carrying the last probe error.
pub async fn await_ready<R>(
    runtime: &R, instance: &InstanceHandle, probe: &ReadinessProbe, events: &EventSink,
) -> Result<ProbeSummary, ReadinessError>
where
    R: ContainerRuntime + ?Sized,
{
    let service = &instance.service;
    let started = Instant::now();

    if !probe.start_period.is_zero() {
        debug!(service = %service, start_period = ?probe.start_period, "Waiting out start period before probing.");
        sleep(probe.start_period).await;
    }

    let mut last_error = String::new();
    for attempt in 1..=probe.retries {
        let result = match timeout(probe.timeout, runtime.probe(instance, &probe.check)).await {
            Ok(result) => result.map_err(|e| format!("{:#}", e)),
            Err(_) => Err(format!("probe timed out after {:?}", probe.timeout)),
        };

        match result {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(service = %service, attempts = attempt, elapsed = ?elapsed, "Service is ready.");
                return Ok(ProbeSummary {
                    attempts: attempt,
                    elapsed,
                });
            }
            Err(error) => {
                debug!(service = %service, attempt, retries = probe.retries, error = %error, "Readiness probe failed.");
                events.emit(ActivationEvent::ProbeFailed {
                    service: service.clone(),
                    attempt,
                    error: error.clone(),
                });
                last_error = error;
            }
        }

        if attempt < probe.retries {
            sleep(probe.interval).await;
        }
    }

    Err(ReadinessError::ReadinessTimeout {
        service: service.clone(),
        attempts: probe.retries,
        elapsed: started.elapsed(),
        last_error,
    })
}
