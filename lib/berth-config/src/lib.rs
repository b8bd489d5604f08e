//! Configuration for berth.
//!
//! Two distinct kinds of configuration live here:
//!
//! - operator settings, layered from an optional YAML file and `BERTH_`-prefixed environment variables through
//!   [`ConfigurationLoader`], and
//! - shared service configuration, the flat `KEY=VALUE` files that topologies hand to every service that references
//!   them, loaded as a [`ConfigurationSource`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use berth_error::GenericError;
use figment::{error::Kind, providers::Env, Figment, Provider as _};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod env_file;
mod provider;

pub use self::env_file::ConfigurationSource;
use self::provider::{BoxedProvider, ResolvedProvider};

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A field's value had the wrong data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// A referenced configuration source file does not exist.
    #[snafu(display("Configuration source '{}' not found at '{}'.", name, path.display()))]
    MissingSource {
        /// Name of the configuration source.
        name: String,

        /// Path the source was expected at.
        path: PathBuf,
    },

    /// A configuration source file exists but could not be read.
    #[snafu(display("Failed to read configuration source '{}' from '{}'.", name, path.display()))]
    Unreadable {
        /// Name of the configuration source.
        name: String,

        /// Path of the source file.
        path: PathBuf,

        /// Error source.
        source: std::io::Error,
    },

    /// A configuration source file contains a line that is not a valid `KEY=VALUE` assignment.
    #[snafu(display(
        "Malformed line in configuration source '{}' ({}): '{}'.",
        name,
        path.display(),
        line
    ))]
    Malformed {
        /// Name of the configuration source.
        name: String,

        /// Path of the source file.
        path: PathBuf,

        /// Offending line.
        line: String,
    },

    /// A configuration source value references a key that isn't defined earlier in the same source.
    #[snafu(display(
        "Key '{}' of configuration source '{}' ({}) references undefined key '{}'.",
        key,
        name,
        path.display(),
        reference
    ))]
    UndefinedReference {
        /// Name of the configuration source.
        name: String,

        /// Path of the source file.
        path: PathBuf,

        /// Key whose value holds the reference.
        key: String,

        /// Referenced key.
        reference: String,
    },

    /// A service defines an extra key that shadows a key of its shared configuration source.
    #[snafu(display(
        "Service '{}' redefines key '{}' already provided by configuration source '{}'.",
        service,
        key,
        source_name
    ))]
    ConflictingKey {
        /// Service defining the extra key.
        service: String,

        /// Conflicting key.
        key: String,

        /// Configuration source that already provides the key.
        source_name: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

/// A configuration loader that can pull from various sources.
///
/// Wraps `figment` to expose a small API for loading operator settings. Sources added later take precedence over
/// sources added earlier. Once all sources are added, a typed value is extracted with
/// [`into_typed`][Self::into_typed].
///
/// # Supported sources
///
/// - YAML file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider::new(resolved_provider));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved_provider) => self.providers.push(BoxedProvider::new(resolved_provider)),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Unable to read YAML settings file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `berth` matches
    /// `BERTH_STOP_TIMEOUT_SECS` as the field `stop_timeout_secs`. The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        // `Env` isn't `Send + Sync`, so snapshot it now.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers.push(BoxedProvider::serialized(default_dict.clone()));
        }
        Ok(self)
    }

    /// Consumes the loader and deserializes the merged configuration into `T`.
    ///
    /// # Errors
    ///
    /// If a field is missing (and has no default) or has the wrong type, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        figment.extract().map_err(Into::into)
    }
}
