//! Local training of an experiment.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use fedflow_core::{EnvoyName, ExperimentName};

/// Trains an experiment on the local data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalTrainer: Send + Sync + 'static {
    async fn train(
        &self,
        envoy: &EnvoyName,
        experiment: &ExperimentName,
        archive: &Path,
    ) -> Result<(), anyhow::Error>;
}

/// TLS paths handed to the trainer, so it can reach the aggregator with the envoy identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrainerCredentials {
    pub root_certificate: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

/// Spawns a trainer process per experiment.
///
/// The process finds the envoy name in `FEDFLOW_ENVOY_NAME`, the experiment name in
/// `FEDFLOW_EXPERIMENT_NAME` and the downloaded archive in `FEDFLOW_EXPERIMENT_ARCHIVE`. TLS
/// paths, if any, are passed as `FEDFLOW_ROOT_CERTIFICATE`, `FEDFLOW_CERTIFICATE` and
/// `FEDFLOW_PRIVATE_KEY`. A nonzero exit status is a training failure.
#[derive(Clone, Debug)]
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
    credentials: TrainerCredentials,
}

impl CommandTrainer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            credentials: TrainerCredentials::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: TrainerCredentials) -> Self {
        self.credentials = credentials;
        self
    }
}

#[async_trait]
impl LocalTrainer for CommandTrainer {
    async fn train(
        &self,
        envoy: &EnvoyName,
        experiment: &ExperimentName,
        archive: &Path,
    ) -> Result<(), anyhow::Error> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("FEDFLOW_ENVOY_NAME", envoy.as_str())
            .env("FEDFLOW_EXPERIMENT_NAME", experiment.as_str())
            .env("FEDFLOW_EXPERIMENT_ARCHIVE", archive)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let TrainerCredentials {
            root_certificate,
            certificate,
            private_key,
        } = &self.credentials;
        for (key, path) in &[
            ("FEDFLOW_ROOT_CERTIFICATE", root_certificate),
            ("FEDFLOW_CERTIFICATE", certificate),
            ("FEDFLOW_PRIVATE_KEY", private_key),
        ] {
            if let Some(path) = path {
                command.env(key, path);
            }
        }

        info!("spawning trainer `{}`", self.program);
        let status = command
            .status()
            .await
            .with_context(|| format!("failed to run trainer `{}`", self.program))?;
        debug!("trainer exited with {}", status);
        if !status.success() {
            bail!("trainer exited with {}", status);
        }
        Ok(())
    }
}
