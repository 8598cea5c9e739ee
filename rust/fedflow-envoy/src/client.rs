//! The director calls made by an envoy.

use std::{path::Path, time::Duration};

use async_trait::async_trait;

use fedflow_core::{EnvoyName, ExperimentName};
use fedflow_sdk::{Client, ClientError};

/// The director as seen by an envoy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectorClient: Send + Sync + 'static {
    /// Registers the envoy. Returns whether the director accepted it.
    async fn connect_envoy(&self, envoy: &EnvoyName) -> Result<bool, ClientError>;

    /// Sends a heartbeat and returns the period until the next one.
    async fn update_status(
        &self,
        envoy: &EnvoyName,
        is_experiment_running: bool,
    ) -> Result<Duration, ClientError>;

    /// Waits for the next experiment assigned to the envoy.
    async fn wait_experiment(&self, envoy: &EnvoyName) -> Result<ExperimentName, ClientError>;

    /// Downloads the archive of an experiment to `path`.
    async fn get_experiment_data(
        &self,
        experiment: &ExperimentName,
        envoy: &EnvoyName,
        path: &Path,
    ) -> Result<u64, ClientError>;
}

#[async_trait]
impl DirectorClient for Client {
    async fn connect_envoy(&self, envoy: &EnvoyName) -> Result<bool, ClientError> {
        Client::connect_envoy(self, envoy).await
    }

    async fn update_status(
        &self,
        envoy: &EnvoyName,
        is_experiment_running: bool,
    ) -> Result<Duration, ClientError> {
        Client::update_status(self, envoy, is_experiment_running).await
    }

    async fn wait_experiment(&self, envoy: &EnvoyName) -> Result<ExperimentName, ClientError> {
        Client::wait_experiment(self, envoy).await
    }

    async fn get_experiment_data(
        &self,
        experiment: &ExperimentName,
        envoy: &EnvoyName,
        path: &Path,
    ) -> Result<u64, ClientError> {
        Client::get_experiment_data(self, experiment, envoy, path).await
    }
}
