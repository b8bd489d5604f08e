//! Service topology loading and activation.
//!
//! A [`Topology`][topology::Topology] describes a set of long-running services, the dependencies between them, and how
//! each one signals readiness. The [`Orchestrator`][orchestrator::Orchestrator] brings a topology up against a
//! [`ContainerRuntime`][runtime::ContainerRuntime], launching every service only once all of its dependencies are
//! ready, and tears it down again in reverse.

pub mod build;
pub mod events;
pub mod orchestrator;
pub mod readiness;
pub mod runtime;
pub mod topology;
pub mod volumes;

#[cfg(test)]
mod test_util;
