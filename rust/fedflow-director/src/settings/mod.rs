//! Loading and validation of the director settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the
//! repository root.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::runner::SecurityContext;
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
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[serde(default)]
    #[validate]
    pub api: ApiSettings,
    #[serde(default)]
    #[validate]
    pub director: DirectorSettings,
    #[validate]
    pub aggregator: AggregatorSettings,
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
                Environment::with_prefix("fedflow")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[validate(schema(function = "validate_api"))]
/// API settings.
///
/// Mutually authenticated TLS requires the `tls` feature and all of `root_certificate`,
/// `certificate` and `private_key`. Without them the API is served over plain HTTP.
pub struct ApiSettings {
    /// The address to which the API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:50051"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFLOW_API__BIND_ADDRESS=127.0.0.1:50051
    /// ```
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// The trust anchor client certificates are verified against.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// root_certificate = "cert/root_ca.crt"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFLOW_API__ROOT_CERTIFICATE=cert/root_ca.crt
    /// ```
    #[serde(default)]
    pub root_certificate: Option<PathBuf>,

    /// The PEM encoded certificate chain of the director.
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    /// The PEM encoded private key of the director.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

fn default_bind_address() -> SocketAddr {
    ([127, 0, 0, 1], 50051).into()
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            root_certificate: None,
            certificate: None,
            private_key: None,
        }
    }
}

impl ApiSettings {
    /// Checks whether mutually authenticated TLS is configured.
    pub fn tls_enabled(&self) -> bool {
        cfg!(feature = "tls") && self.certificate.is_some()
    }

    /// The TLS material as handed to the aggregator.
    pub fn security_context(&self) -> SecurityContext {
        if !self.tls_enabled() {
            return SecurityContext::default();
        }
        SecurityContext {
            tls: true,
            root_certificate: self.root_certificate.clone(),
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone(),
        }
    }
}

/// A wrapper for validate derive.
fn validate_api(s: &ApiSettings) -> Result<(), ValidationError> {
    match (&s.root_certificate, &s.certificate, &s.private_key) {
        (None, None, None) => Ok(()),
        (Some(_), Some(_), Some(_)) if cfg!(feature = "tls") => Ok(()),
        (Some(_), Some(_), Some(_)) => Err(ValidationError::new("tls feature disabled")),
        _ => Err(ValidationError::new("invalid tls settings")),
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
/// Director settings.
pub struct DirectorSettings {
    /// The period in seconds between two heartbeats of an envoy. An envoy is considered offline
    /// once twice this period passed without a heartbeat. Must be between `1` and `86400`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [director]
    /// envoy_health_check_period = 60
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFLOW_DIRECTOR__ENVOY_HEALTH_CHECK_PERIOD=60
    /// ```
    #[serde(default = "default_health_check_period")]
    #[validate(range(min = 1, max = 86400))]
    pub envoy_health_check_period: u64,

    /// Whether each submitted experiment must be accepted on the console of the director
    /// before it is queued.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [director]
    /// review_experiment = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFLOW_DIRECTOR__REVIEW_EXPERIMENT=true
    /// ```
    #[serde(default)]
    pub review_experiment: bool,

    /// The directory where uploaded archives are stored.
    #[serde(default = "default_workspace")]
    pub workspace: std::path::PathBuf,
}

fn default_health_check_period() -> u64 {
    60
}

fn default_workspace() -> std::path::PathBuf {
    "director_workspace".into()
}

impl Default for DirectorSettings {
    fn default() -> Self {
        Self {
            envoy_health_check_period: default_health_check_period(),
            review_experiment: false,
            workspace: default_workspace(),
        }
    }
}

impl DirectorSettings {
    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.envoy_health_check_period)
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
/// Aggregator settings.
pub struct AggregatorSettings {
    /// The program run for every experiment, followed by its arguments.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// command = ["python", "-m", "aggregator"]
    /// ```
    #[validate(length(min = 1))]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_new() {
        let settings = Settings::new("../../configs/director.toml").unwrap();
        assert_eq!(settings.director.envoy_health_check_period, 60);
        assert!(!settings.director.review_experiment);
        assert!(!settings.api.tls_enabled());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_validate_health_check_period() {
        let mut director = DirectorSettings::default();
        assert!(director.validate().is_ok());
        assert_eq!(director.health_check_period(), Duration::from_secs(60));

        director.envoy_health_check_period = 0;
        assert!(director.validate().is_err());
        director.envoy_health_check_period = 86401;
        assert!(director.validate().is_err());
        director.envoy_health_check_period = 86400;
        assert!(director.validate().is_ok());
    }

    #[test]
    fn test_validate_aggregator() {
        let aggregator = AggregatorSettings { command: vec![] };
        assert!(aggregator.validate().is_err());
    }

    #[test]
    fn test_validate_api() {
        let mut api = ApiSettings::default();
        assert!(api.validate().is_ok());
        assert!(!api.security_context().tls);

        api.certificate = Some("director.crt".into());
        assert!(api.validate().is_err());

        api.private_key = Some("director.key".into());
        api.root_certificate = Some("root_ca.crt".into());
        // configured TLS is never silently downgraded to plain HTTP
        assert_eq!(api.validate().is_ok(), cfg!(feature = "tls"));
        assert_eq!(api.tls_enabled(), cfg!(feature = "tls"));
        assert_eq!(api.security_context().tls, cfg!(feature = "tls"));
    }
}
