//! berth: starts a multi-service application in dependency order, waiting for each service to be ready before starting
//! the services that depend on it.

use std::process::ExitCode;

use berth_app::prelude::*;
use berth_core::{
    build::{BuildPolicy, ImageBuilder},
    events::{create_event_channel, EventSink},
    orchestrator::Orchestrator,
    runtime::ContainerRuntime as _,
    topology::{Topology, TopologyLoader},
    volumes::VolumeManager,
};
use berth_error::{ErrorContext as _, ExitStatus, GenericError};
use clap::Parser as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;
use self::config::{Action, Cli, Settings, UpConfig, VolumeAction};

mod driver;
use self::driver::DockerRuntime;

mod reporter;
use self::reporter::{
    render_event, ActivationSummary, BuildList, InstanceList, OutputFormat, Reporter, ShutdownSummary,
    TopologySummary, VolumeList,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            error!("{:?}", e);
            ExitStatus::Fatal.into()
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus, GenericError> {
    let settings = Settings::load(&cli.settings)
        .with_error_context(|| format!("Failed to load settings from '{}'.", cli.settings.display()))?;
    debug!(?settings, "Loaded settings.");

    let topology = load_topology(&cli, &settings)?;
    debug!(project = topology.project(), services = topology.activation_order().len(), "Loaded topology.");

    if let Action::Config(output) = &cli.action {
        Reporter::new(output.format).report(&TopologySummary::from(&topology))?;
        return Ok(ExitStatus::Success);
    }

    let mut runtime = DockerRuntime::connect(settings.network_driver.clone())?;
    if let Some(log_dir) = &settings.log_dir {
        runtime = runtime.with_logging(log_dir.clone());
    }

    match cli.action {
        Action::Up(config) => up(&runtime, &topology, &settings, config).await,
        Action::Down(output) => {
            let (events, progress) = spawn_progress_printer(output.format);
            let report = Orchestrator::new(&runtime)
                .with_events(events)
                .with_stop_timeout(settings.stop_timeout())
                .shutdown(&topology)
                .await?;
            finish_progress(progress).await;

            Reporter::new(output.format).report(&ShutdownSummary::from(&report))?;
            Ok(report.exit_status())
        }
        Action::Build(output) => {
            let (events, progress) = spawn_progress_printer(output.format);
            let images = ImageBuilder::new(&runtime, topology.project())
                .with_events(events)
                .resolve(&topology, BuildPolicy::Missing)
                .await;
            finish_progress(progress).await;

            let images = images?;
            Reporter::new(output.format).report(&BuildList(images.builds()))?;
            Ok(ExitStatus::Success)
        }
        Action::Ps(output) => {
            let instances = runtime.list_instances(topology.project()).await?;
            Reporter::new(output.format).report(&InstanceList(instances))?;
            Ok(ExitStatus::Success)
        }
        Action::Volume(VolumeAction::Ls(output)) => {
            let volumes = VolumeManager::new(&runtime, topology.project()).list().await?;
            Reporter::new(output.format).report(&VolumeList(volumes))?;
            Ok(ExitStatus::Success)
        }
        Action::Volume(VolumeAction::Rm { names }) => {
            let removed = VolumeManager::new(&runtime, topology.project()).remove(&names).await?;
            for name in removed {
                println!("Removed volume '{}'.", name);
            }
            Ok(ExitStatus::Success)
        }
        Action::Config(_) => Ok(ExitStatus::Success),
    }
}

fn load_topology(cli: &Cli, settings: &Settings) -> Result<Topology, GenericError> {
    let topology = TopologyLoader::load(&cli.file)
        .with_error_context(|| format!("Failed to load topology from '{}'.", cli.file.display()))?;

    match cli.project_name.as_deref().or(settings.project_name.as_deref()) {
        Some(project) => Ok(topology.with_project(project)?),
        None => Ok(topology),
    }
}

async fn up(
    runtime: &DockerRuntime, topology: &Topology, settings: &Settings, config: UpConfig,
) -> Result<ExitStatus, GenericError> {
    let format = config.output.format;
    let policy = if config.no_build {
        BuildPolicy::Never
    } else {
        BuildPolicy::Missing
    };

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted. Cancelling activation...");
                cancel.cancel();
            }
        }
    });

    let (events, progress) = spawn_progress_printer(format);
    let result = async {
        let images = ImageBuilder::new(runtime, topology.project())
            .with_events(events.clone())
            .resolve(topology, policy)
            .await?;

        let orchestrator = Orchestrator::new(runtime)
            .with_events(events)
            .with_stop_timeout(settings.stop_timeout())
            .with_cancellation(cancel);

        let report = orchestrator.activate(topology, &images).await?;
        let mut status = report.exit_status();
        if !report.is_success() && config.teardown_on_failure {
            info!(project = topology.project(), "Activation failed. Tearing down launched services...");
            let shutdown = orchestrator.shutdown(topology).await?;
            status = status.merge(shutdown.exit_status());
        }

        Ok::<_, GenericError>((report, status))
    }
    .await;
    interrupt.abort();
    finish_progress(progress).await;

    let (report, status) = result?;
    for failure in report.failures() {
        error!(service = %failure.service(), "{}", failure);
    }
    Reporter::new(format).report(&ActivationSummary::from(&report))?;

    Ok(status)
}

/// Prints lifecycle events to standard error as they happen, when reporting as text.
fn spawn_progress_printer(format: OutputFormat) -> (EventSink, Option<JoinHandle<()>>) {
    if format != OutputFormat::Text {
        return (EventSink::default(), None);
    }

    let (events, mut rx) = create_event_channel();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = render_event(&event) {
                eprintln!("{}", line);
            }
        }
    });

    (events, Some(progress))
}

/// Waits for the progress printer to drain. Every sink must have been dropped by now.
async fn finish_progress(progress: Option<JoinHandle<()>>) {
    if let Some(progress) = progress {
        if let Err(e) = progress.await {
            warn!(error = %e, "Progress printer stopped unexpectedly.");
        }
    }
}
