use std::{fmt::Write as _, time::Duration};

use berth_core::{
    build::{BuildStatus, ImageBuild},
    events::ActivationEvent,
    orchestrator::{ActivationReport, ServiceOutcome, ShutdownReport, StopOutcome},
    readiness::ReadinessState,
    runtime::{InstanceInfo, VolumeInfo},
    topology::{ServiceDefinition, ServiceName, Topology, VolumeDefinition},
};
use berth_error::{ErrorContext as _, GenericError};
use clap::ValueEnum;
use colored::{ColoredString, Colorize as _};
use serde::Serialize;

/// Output format for command results.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// A result with a human-readable rendering.
pub trait RenderText {
    fn render_text(&self) -> Result<String, GenericError>;
}

/// Reporter for command results.
///
/// Results go to standard output, so they can be piped; progress lines and logs go to standard error.
pub struct Reporter {
    format: OutputFormat,
}

impl Reporter {
    /// Create a new reporter with the given output format.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn report<T>(&self, result: &T) -> Result<(), GenericError>
    where
        T: Serialize + RenderText,
    {
        match self.format {
            OutputFormat::Text => print!("{}", result.render_text()?),
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(result).error_context("Failed to serialize result as JSON.")?;
                println!("{}", json);
            }
        }
        Ok(())
    }
}

fn status_word(word: &str) -> ColoredString {
    // Pad before coloring, since escape codes would otherwise count towards the width.
    let padded = format!("{:<9}", word);
    match word {
        "READY" | "STOPPED" | "BUILT" => padded.green().bold(),
        "CACHED" => padded.green(),
        "FAILED" => padded.red().bold(),
        _ => padded.yellow().bold(),
    }
}

/// Result of a single service's activation.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceSummary {
    pub service: ServiceName,
    pub state: ReadinessState,
    pub outcome: &'static str,
    pub probed: bool,
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", with = "duration_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<ServiceName>,
}

/// Result of `up`.
#[derive(Clone, Debug, Serialize)]
pub struct ActivationSummary {
    pub project: String,
    pub success: bool,
    /// Services in the order they became ready.
    pub launch_order: Vec<ServiceName>,
    pub services: Vec<ServiceSummary>,
}

impl From<&ActivationReport> for ActivationSummary {
    fn from(report: &ActivationReport) -> Self {
        let services = report
            .services
            .iter()
            .map(|service| {
                let (outcome, error, blocked_by) = match &service.outcome {
                    ServiceOutcome::Ready => ("ready", None, None),
                    ServiceOutcome::Failed { error } => ("failed", Some(error.to_string()), None),
                    ServiceOutcome::Skipped { blocked_by } => ("skipped", None, Some(blocked_by.clone())),
                    ServiceOutcome::Cancelled => ("cancelled", None, None),
                };

                ServiceSummary {
                    service: service.service.clone(),
                    state: service.state,
                    outcome,
                    probed: service.probed,
                    attempts: service.attempts,
                    elapsed: service.elapsed,
                    error,
                    blocked_by,
                }
            })
            .collect();

        Self {
            project: report.project.clone(),
            success: report.is_success(),
            launch_order: report.launch_order.clone(),
            services,
        }
    }
}

impl RenderText for ActivationSummary {
    fn render_text(&self) -> Result<String, GenericError> {
        let mut out = String::new();
        for service in &self.services {
            match service.outcome {
                "ready" if service.probed => writeln!(
                    out,
                    "{} {} ({} probe(s), {:.2?})",
                    status_word("READY"),
                    service.service,
                    service.attempts,
                    service.elapsed
                )?,
                "ready" => writeln!(out, "{} {} (running, no readiness probe)", status_word("READY"), service.service)?,
                "failed" => writeln!(
                    out,
                    "{} {}: {}",
                    status_word("FAILED"),
                    service.service,
                    service.error.as_deref().unwrap_or_default()
                )?,
                "skipped" => writeln!(
                    out,
                    "{} {}: blocked by '{}'",
                    status_word("SKIPPED"),
                    service.service,
                    service.blocked_by.as_deref().unwrap_or_default()
                )?,
                _ => writeln!(out, "{} {}", status_word("CANCELLED"), service.service)?,
            }
        }

        let count = |outcome: &str| self.services.iter().filter(|s| s.outcome == outcome).count();
        let status = if self.success {
            "UP".green().bold()
        } else {
            "DEGRADED".red().bold()
        };
        writeln!(
            out,
            "{} {}: {} ready, {} failed, {} skipped, {} cancelled",
            status,
            self.project,
            count("ready"),
            count("failed"),
            count("skipped"),
            count("cancelled")
        )?;

        Ok(out)
    }
}

/// Result of stopping a single instance.
#[derive(Clone, Debug, Serialize)]
pub struct StopSummary {
    pub service: ServiceName,
    pub instance: String,
    pub outcome: &'static str,
    pub orphan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_for: Option<ServiceName>,
}

/// Result of `down`.
#[derive(Clone, Debug, Serialize)]
pub struct ShutdownSummary {
    pub project: String,
    pub success: bool,
    pub network_removed: bool,
    pub instances: Vec<StopSummary>,
}

impl From<&ShutdownReport> for ShutdownSummary {
    fn from(report: &ShutdownReport) -> Self {
        let instances = report
            .instances
            .iter()
            .map(|stop| {
                let (outcome, error, held_for) = match &stop.outcome {
                    StopOutcome::Stopped => ("stopped", None, None),
                    StopOutcome::Failed { error } => ("failed", Some(format!("{:#}", error)), None),
                    StopOutcome::Held { dependent } => ("held", None, Some(dependent.clone())),
                };

                StopSummary {
                    service: stop.service.clone(),
                    instance: stop.instance.clone(),
                    outcome,
                    orphan: stop.orphan,
                    error,
                    held_for,
                }
            })
            .collect();

        Self {
            project: report.project.clone(),
            success: report.is_success(),
            network_removed: report.network_removed,
            instances,
        }
    }
}

impl RenderText for ShutdownSummary {
    fn render_text(&self) -> Result<String, GenericError> {
        let mut out = String::new();
        if self.instances.is_empty() {
            writeln!(out, "Nothing to stop for project '{}'.", self.project)?;
        }

        for stop in &self.instances {
            let orphan = if stop.orphan { " (orphan)" } else { "" };
            match stop.outcome {
                "stopped" => writeln!(out, "{} {}{}", status_word("STOPPED"), stop.instance, orphan)?,
                "failed" => writeln!(
                    out,
                    "{} {}{}: {}",
                    status_word("FAILED"),
                    stop.instance,
                    orphan,
                    stop.error.as_deref().unwrap_or_default()
                )?,
                _ => writeln!(
                    out,
                    "{} {}: '{}' failed to stop",
                    status_word("HELD"),
                    stop.instance,
                    stop.held_for.as_deref().unwrap_or_default()
                )?,
            }
        }

        if !self.success {
            writeln!(
                out,
                "{} some instances of '{}' are still running.",
                "INCOMPLETE".red().bold(),
                self.project
            )?;
        }

        Ok(out)
    }
}

/// Result of `config`.
#[derive(Debug, Serialize)]
pub struct TopologySummary<'a> {
    pub project: &'a str,
    pub activation_order: &'a [ServiceName],
    pub services: Vec<&'a ServiceDefinition>,
    pub volumes: Vec<&'a VolumeDefinition>,
}

impl<'a> From<&'a Topology> for TopologySummary<'a> {
    fn from(topology: &'a Topology) -> Self {
        Self {
            project: topology.project(),
            activation_order: topology.activation_order(),
            services: topology.services().collect(),
            volumes: topology.volumes().collect(),
        }
    }
}

impl RenderText for TopologySummary<'_> {
    fn render_text(&self) -> Result<String, GenericError> {
        serde_yaml::to_string(self).error_context("Failed to render topology as YAML.")
    }
}

/// Result of `ps`.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct InstanceList(pub Vec<InstanceInfo>);

impl RenderText for InstanceList {
    fn render_text(&self) -> Result<String, GenericError> {
        let mut out = String::new();
        if self.0.is_empty() {
            writeln!(out, "No instances.")?;
            return Ok(out);
        }

        writeln!(out, "{:<16} {:<28} {:<24} PORTS", "SERVICE", "INSTANCE", "STATUS")?;
        for instance in &self.0 {
            let ports = instance
                .handle
                .ports
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                out,
                "{:<16} {:<28} {:<24} {}",
                instance.handle.service, instance.handle.name, instance.status, ports
            )?;
        }
        Ok(out)
    }
}

/// Result of `volume ls`.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct VolumeList(pub Vec<VolumeInfo>);

impl RenderText for VolumeList {
    fn render_text(&self) -> Result<String, GenericError> {
        let mut out = String::new();
        if self.0.is_empty() {
            writeln!(out, "No volumes.")?;
            return Ok(out);
        }

        writeln!(out, "{:<24} {:<32} DRIVER", "VOLUME", "NAME")?;
        for volume in &self.0 {
            writeln!(
                out,
                "{:<24} {:<32} {}",
                volume.volume.as_deref().unwrap_or("-"),
                volume.name,
                volume.driver
            )?;
        }
        Ok(out)
    }
}

/// Result of `build`.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct BuildList<'a>(pub &'a [ImageBuild]);

impl RenderText for BuildList<'_> {
    fn render_text(&self) -> Result<String, GenericError> {
        let mut out = String::new();
        if self.0.is_empty() {
            writeln!(out, "No service has a build recipe.")?;
        }

        for build in self.0 {
            let status = match build.status {
                BuildStatus::Built => status_word("BUILT"),
                BuildStatus::Cached => status_word("CACHED"),
            };
            let services = build.services.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
            writeln!(out, "{} {} ({})", status, build.tag, services)?;
        }
        Ok(out)
    }
}

/// Renders a lifecycle event as a progress line.
///
/// Returns `None` for events not worth a line of their own.
pub fn render_event(event: &ActivationEvent) -> Option<String> {
    let line = match event {
        ActivationEvent::VolumeEnsured { volume, created: true } => format!("volume {} created", volume),
        ActivationEvent::VolumeEnsured { created: false, .. } => return None,
        ActivationEvent::ImageBuilding { tag, services } => format!(
            "building {} for {}",
            tag,
            services.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        ),
        ActivationEvent::ImageReady { tag, built: true } => format!("built {}", tag),
        ActivationEvent::ImageReady { built: false, .. } => return None,
        ActivationEvent::Launching { service } => format!("[{}] launching", service),
        ActivationEvent::Probing { service } => format!("[{}] waiting for readiness", service),
        ActivationEvent::ProbeFailed {
            service,
            attempt,
            error,
        } => format!("[{}] probe {} failed: {}", service, attempt, error),
        ActivationEvent::Ready {
            service,
            attempts,
            elapsed,
        } => format!("[{}] {} after {} probe(s), {:.2?}", service, "ready".green(), attempts, elapsed),
        ActivationEvent::Failed { service, error } => format!("[{}] {}: {}", service, "failed".red(), error),
        ActivationEvent::Skipped { service, blocked_by } => {
            format!("[{}] {}: blocked by '{}'", service, "skipped".yellow(), blocked_by)
        }
        ActivationEvent::Cancelled { service } => format!("[{}] {}", service, "cancelled".yellow()),
        ActivationEvent::Stopping { service } => format!("[{}] stopping", service),
        ActivationEvent::Stopped { service } => format!("[{}] stopped", service),
        ActivationEvent::StopFailed { service, error } => format!("[{}] {}: {}", service, "stop failed".red(), error),
        ActivationEvent::Held { service, dependent } => {
            format!("[{}] {}: '{}' is still running", service, "held".yellow(), dependent)
        }
    };

    Some(line)
}

/// Serde helper for serializing Duration as milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use berth_core::{readiness::ReadinessError, runtime::InstanceHandle, topology::TopologyLoader};

    use super::*;

    fn name(name: &str) -> ServiceName {
        ServiceName::try_from(name).unwrap()
    }

    fn degraded_report() -> ActivationReport {
        ActivationReport {
            project: "store".to_string(),
            services: vec![
                berth_core::orchestrator::ServiceReport {
                    service: name("db"),
                    state: ReadinessState::Failed,
                    outcome: ServiceOutcome::Failed {
                        error: ReadinessError::ReadinessTimeout {
                            service: name("db"),
                            attempts: 3,
                            elapsed: Duration::from_secs(2),
                            last_error: "connection refused".to_string(),
                        },
                    },
                    probed: true,
                    attempts: 3,
                    elapsed: Duration::from_secs(2),
                },
                berth_core::orchestrator::ServiceReport {
                    service: name("redis"),
                    state: ReadinessState::Ready,
                    outcome: ServiceOutcome::Ready,
                    probed: false,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                },
                berth_core::orchestrator::ServiceReport {
                    service: name("web"),
                    state: ReadinessState::Starting,
                    outcome: ServiceOutcome::Skipped { blocked_by: name("db") },
                    probed: false,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                },
            ],
            launch_order: vec![name("redis")],
            instances: Vec::new(),
        }
    }

    #[test]
    fn activation_text_names_failures_and_blockers() {
        colored::control::set_override(false);

        let summary = ActivationSummary::from(&degraded_report());
        assert!(!summary.success);

        let text = summary.render_text().unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "FAILED    db: 'db' was not ready after 3 probe(s) over 2s; last error: connection refused"
        );
        assert_eq!(lines[1], "READY     redis (running, no readiness probe)");
        assert_eq!(lines[2], "SKIPPED   web: blocked by 'db'");
        assert_eq!(lines[3], "DEGRADED store: 1 ready, 1 failed, 1 skipped, 0 cancelled");
    }

    #[test]
    fn activation_json() {
        let summary = ActivationSummary::from(&degraded_report());
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["launch_order"], serde_json::json!(["redis"]));
        assert_eq!(json["services"][0]["state"], "failed");
        assert_eq!(json["services"][0]["elapsed_ms"], 2000);
        assert_eq!(json["services"][2]["blocked_by"], "db");
        assert!(json["services"][1].get("error").is_none());
    }

    #[test]
    fn shutdown_text() {
        colored::control::set_override(false);

        let report = ShutdownReport {
            project: "store".to_string(),
            instances: vec![
                berth_core::orchestrator::StopReport {
                    service: name("web"),
                    instance: "store-web".to_string(),
                    outcome: StopOutcome::Failed {
                        error: berth_error::generic_error!("daemon went away"),
                    },
                    orphan: false,
                },
                berth_core::orchestrator::StopReport {
                    service: name("db"),
                    instance: "store-db".to_string(),
                    outcome: StopOutcome::Held { dependent: name("web") },
                    orphan: false,
                },
            ],
            network_removed: false,
        };

        let text = ShutdownSummary::from(&report).render_text().unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "FAILED    store-web: daemon went away");
        assert_eq!(lines[1], "HELD      store-db: 'web' failed to stop");
        assert_eq!(lines[2], "INCOMPLETE some instances of 'store' are still running.");
    }

    #[test]
    fn topology_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let topology = TopologyLoader::load_str(
            "name: shop\nservices:\n  web:\n    image: nginx\n    depends_on: [db]\n  db:\n    image: postgres\n",
            dir.path(),
        )
        .unwrap();

        let yaml = TopologySummary::from(&topology).render_text().unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["project"].as_str(), Some("shop"));
        assert_eq!(value["activation_order"][0].as_str(), Some("db"));
        assert_eq!(value["activation_order"][1].as_str(), Some("web"));
    }

    #[test]
    fn instance_table() {
        let list = InstanceList(vec![InstanceInfo {
            handle: InstanceHandle {
                service: name("db"),
                id: "abc".to_string(),
                name: "store-db".to_string(),
                ports: Vec::new(),
            },
            image: "postgres:16".to_string(),
            status: "Up 2 minutes".to_string(),
            running: true,
            volumes: vec!["store_postgres_data".to_string()],
        }]);

        let text = list.render_text().unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert!(lines[0].starts_with("SERVICE"));
        assert!(lines[1].starts_with("db "));
        assert!(lines[1].contains("store-db"));
        assert!(lines[1].contains("Up 2 minutes"));

        assert_eq!(InstanceList(Vec::new()).render_text().unwrap(), "No instances.\n");
    }

    #[test]
    fn progress_lines() {
        colored::control::set_override(false);

        let db = name("db");
        assert_eq!(
            render_event(&ActivationEvent::ProbeFailed {
                service: db.clone(),
                attempt: 2,
                error: "exit code 2".to_string()
            })
            .as_deref(),
            Some("[db] probe 2 failed: exit code 2")
        );
        assert_eq!(
            render_event(&ActivationEvent::Skipped {
                service: name("web"),
                blocked_by: db
            })
            .as_deref(),
            Some("[web] skipped: blocked by 'db'")
        );
        assert!(render_event(&ActivationEvent::VolumeEnsured {
            volume: "store_redis_data".to_string(),
            created: false
        })
        .is_none());
    }
}
