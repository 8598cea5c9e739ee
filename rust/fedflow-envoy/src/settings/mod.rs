//! Loading and validation of the envoy settings.
//!
//! Values defined in the configuration file can be overridden by environment variables prefixed
//! with `FEDFLOW_ENVOY_`, for instance `FEDFLOW_ENVOY_ENVOY__NAME=envoy_two`.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use thiserror::Error;
use url::Url;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::trainer::TrainerCredentials;
pub use fedflow_core::settings::LoggingSettings;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
pub struct Settings {
    #[validate]
    pub envoy: EnvoySettings,
    #[validate]
    pub director: DirectorSettings,
    #[validate]
    pub trainer: TrainerSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("fedflow_envoy")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
/// Envoy settings.
pub struct EnvoySettings {
    /// The name under which the envoy registers. Experiments name their collaborators by it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [envoy]
    /// name = "envoy_one"
    /// ```
    #[validate(length(min = 1))]
    pub name: String,

    /// Seconds to wait before waiting for the next experiment once fetching one failed.
    #[serde(default = "default_retry_timeout")]
    #[validate(range(min = 1, max = 3600))]
    pub retry_timeout: u64,

    /// The directory where downloaded archives are stored while an experiment runs.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

fn default_retry_timeout() -> u64 {
    5
}

fn default_workspace() -> PathBuf {
    "envoy_workspace".into()
}

impl EnvoySettings {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout)
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[validate(schema(function = "validate_director"))]
/// How to reach the director.
///
/// TLS requires the `tls` feature and all of `root_certificate`, `certificate` and
/// `private_key`.
pub struct DirectorSettings {
    /// The URL of the director API.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [director]
    /// url = "https://director.example.com:50051"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFLOW_ENVOY_DIRECTOR__URL=https://director.example.com:50051
    /// ```
    pub url: Url,

    #[serde(default)]
    pub root_certificate: Option<PathBuf>,

    #[serde(default)]
    pub certificate: Option<PathBuf>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

impl DirectorSettings {
    /// Checks whether the director is reached over mutually authenticated TLS.
    pub fn tls_enabled(&self) -> bool {
        self.certificate.is_some()
    }

    pub fn credentials(&self) -> TrainerCredentials {
        TrainerCredentials {
            root_certificate: self.root_certificate.clone(),
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone(),
        }
    }
}

/// A wrapper for validate derive.
fn validate_director(s: &DirectorSettings) -> Result<(), ValidationError> {
    match (&s.root_certificate, &s.certificate, &s.private_key) {
        (None, None, None) => Ok(()),
        (Some(_), Some(_), Some(_)) if cfg!(feature = "tls") => Ok(()),
        (Some(_), Some(_), Some(_)) => Err(ValidationError::new("tls feature disabled")),
        _ => Err(ValidationError::new("invalid tls settings")),
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
/// Trainer settings.
pub struct TrainerSettings {
    /// The program run for every experiment, followed by its arguments.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [trainer]
    /// command = ["python", "-m", "trainer"]
    /// ```
    #[validate(length(min = 1))]
    pub command: Vec<String>,
}
