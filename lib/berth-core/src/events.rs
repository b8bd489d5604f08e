//! Lifecycle events.
//!
//! The orchestrator, volume manager, and image builder report progress as [`ActivationEvent`]s. Consumers (such as a
//! CLI rendering progress lines) receive them over an unbounded channel; emitting never blocks and never fails, even
//! once the receiver is gone.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::topology::ServiceName;

/// A lifecycle event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActivationEvent {
    /// A named volume exists, either because it was just created or because it was already there.
    VolumeEnsured { volume: String, created: bool },

    /// An image is being built.
    ImageBuilding { tag: String, services: Vec<ServiceName> },

    /// An image is ready to use, either freshly built or already present.
    ImageReady { tag: String, built: bool },

    /// A service's dependencies are ready and its instance is being launched.
    Launching { service: ServiceName },

    /// A service's instance is running and its readiness is being probed.
    Probing { service: ServiceName },

    /// A readiness probe failed; more attempts may follow.
    ProbeFailed {
        service: ServiceName,
        attempt: u32,
        error: String,
    },

    /// A service became ready.
    Ready {
        service: ServiceName,
        attempts: u32,
        elapsed: Duration,
    },

    /// A service failed to launch or never became ready.
    Failed { service: ServiceName, error: String },

    /// A service was never launched because one of its dependencies failed.
    Skipped {
        service: ServiceName,
        blocked_by: ServiceName,
    },

    /// Activation was interrupted before the service became ready.
    Cancelled { service: ServiceName },

    /// A service instance is being stopped.
    Stopping { service: ServiceName },

    /// A service instance was stopped and removed.
    Stopped { service: ServiceName },

    /// A service instance failed to stop.
    StopFailed { service: ServiceName, error: String },

    /// A service was left running because a dependent of it failed to stop.
    Held {
        service: ServiceName,
        dependent: ServiceName,
    },
}

/// Receiving half of an event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<ActivationEvent>;

/// Sending half of an event channel.
///
/// The default sink discards every event.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ActivationEvent>>,
}

impl EventSink {
    /// Emits an event.
    pub fn emit(&self, event: ActivationEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}

/// Creates a connected event sink and receiver.
pub fn create_event_channel() -> (EventSink, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx: Some(tx) }, rx)
}
