use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use berth_config::{ConfigurationError, ConfigurationLoader};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

use crate::reporter::OutputFormat;

#[derive(Parser)]
#[command(name = "berth", about, version)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to the topology file.
    ///
    /// Relative paths inside the topology (build contexts, bind mounts, configuration sources) are resolved against the
    /// directory containing this file.
    #[arg(global = true, short = 'f', long = "file", default_value = "berth.yaml")]
    pub file: PathBuf,

    /// Project name.
    ///
    /// Every network, volume, and instance berth creates is scoped to the project. Defaults to the topology's `name`,
    /// then to the name of the directory containing the topology file.
    #[arg(global = true, short = 'p', long = "project-name")]
    pub project_name: Option<String>,

    /// Path to the settings file.
    ///
    /// Optional. Settings can also be given as `BERTH_`-prefixed environment variables, which take precedence.
    #[arg(global = true, long, default_value = "berth.settings.yaml")]
    pub settings: PathBuf,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Build missing images, then start every service in dependency order.
    ///
    /// Exits with 0 once every service is ready, or with 2 if any service failed to become ready.
    Up(UpConfig),

    /// Stop every service of the project, dependents first. Volumes are kept.
    Down(OutputConfig),

    /// Build the images of every service with a build recipe.
    Build(OutputConfig),

    /// Validate the topology, and print it fully resolved along with its activation order.
    Config(OutputConfig),

    /// List the project's service instances.
    Ps(OutputConfig),

    /// Manage the project's named volumes.
    #[command(subcommand)]
    Volume(VolumeAction),
}

/// `up` configuration.
#[derive(Args, Clone, Debug)]
pub struct UpConfig {
    /// Don't build images. Every image must already exist.
    #[arg(long)]
    pub no_build: bool,

    /// Stop every launched service again if any service fails to become ready.
    #[arg(long)]
    pub teardown_on_failure: bool,

    #[command(flatten)]
    pub output: OutputConfig,
}

/// Output configuration.
#[derive(Args, Clone, Debug)]
pub struct OutputConfig {
    /// Output format.
    #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Clone, Debug)]
pub enum VolumeAction {
    /// List the project's volumes.
    Ls(OutputConfig),

    /// Remove volumes, by their name in the topology.
    ///
    /// Refuses to remove anything if any of the volumes is still mounted by an instance of the project.
    Rm {
        /// Volumes to remove.
        #[arg(required = true)]
        names: Vec<String>,
    },
}

/// Operator settings.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Project name, used when neither the command line nor the topology sets one.
    pub project_name: Option<String>,

    /// Directory to capture the standard output and standard error of launched instances into.
    pub log_dir: Option<PathBuf>,

    /// Seconds a stopping instance is given to exit before it is killed.
    pub stop_timeout_secs: u64,

    /// Driver of the project network.
    pub network_driver: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: None,
            log_dir: None,
            stop_timeout_secs: 10,
            network_driver: "bridge".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from the given YAML file, if it exists, and from `BERTH_`-prefixed environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        ConfigurationLoader::default()
            .try_from_yaml(path)
            .from_environment("BERTH")?
            .into_typed()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
