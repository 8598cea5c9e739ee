//! The envoy loops.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{fs, time::sleep};
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::{client::DirectorClient, trainer::LocalTrainer};
use fedflow_core::{EnvoyName, ExperimentName};
use fedflow_sdk::ClientError;

/// Seconds to wait after a failed attempt to fetch an experiment.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
/// Errors which stop an envoy.
pub enum EnvoyError {
    #[error("the director rejected envoy {0}")]
    Rejected(EnvoyName),
    #[error("failed to connect to the director: {0}")]
    Connect(#[source] ClientError),
    #[error("failed to create the workspace: {0}")]
    Workspace(#[source] io::Error),
}

/// An envoy connected to a director.
pub struct Envoy<C, T> {
    name: EnvoyName,
    client: C,
    trainer: T,
    workspace: PathBuf,
    retry_timeout: Duration,
    is_experiment_running: Arc<AtomicBool>,
}

impl<C, T> Envoy<C, T>
where
    C: DirectorClient,
    T: LocalTrainer,
{
    pub fn new(name: EnvoyName, client: C, trainer: T) -> Self {
        Self {
            name,
            client,
            trainer,
            workspace: PathBuf::from("."),
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            is_experiment_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the directory where downloaded archives are stored.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Sets the pause after a failed attempt to fetch an experiment. It is also the heartbeat
    /// period until the director announces one.
    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    pub fn name(&self) -> &EnvoyName {
        &self.name
    }

    pub fn is_experiment_running(&self) -> bool {
        self.is_experiment_running.load(Ordering::SeqCst)
    }

    /// Connects to the director, then sends heartbeats and runs experiments forever.
    ///
    /// # Errors
    /// Fails if the director cannot be reached or rejects the envoy, or if the workspace cannot
    /// be created.
    pub async fn start(&self) -> Result<(), EnvoyError> {
        fs::create_dir_all(&self.workspace)
            .await
            .map_err(EnvoyError::Workspace)?;
        self.connect().await?;
        tokio::select! {
            _ = self.run_health_checks().instrument(info_span!("heartbeat")) => {}
            _ = self.run().instrument(info_span!("work")) => {}
        }
        Ok(())
    }

    /// Registers the envoy with the director.
    pub async fn connect(&self) -> Result<(), EnvoyError> {
        match self.client.connect_envoy(&self.name).await {
            Ok(true) => {
                info!("envoy {} connected to the director", self.name);
                Ok(())
            }
            Ok(false) => Err(EnvoyError::Rejected(self.name.clone())),
            Err(err) => Err(EnvoyError::Connect(err)),
        }
    }

    /// Sends heartbeats forever, at the period requested by the director.
    pub async fn run_health_checks(&self) {
        let mut period = self.retry_timeout;
        loop {
            period = self.send_health_check(period).await;
            sleep(period).await;
        }
    }

    /// Sends one heartbeat and returns the period until the next one.
    ///
    /// If the director lost track of the envoy, the envoy registers again. The previous period is
    /// kept whenever the director does not announce a new one.
    pub async fn send_health_check(&self, period: Duration) -> Duration {
        debug!("sending heartbeat");
        match self
            .client
            .update_status(&self.name, self.is_experiment_running())
            .await
        {
            Ok(period) => period,
            Err(err) if err.is_envoy_not_found() => {
                info!("the director lost envoy {}, reconnecting", self.name);
                if let Err(err) = self.client.connect_envoy(&self.name).await {
                    warn!("failed to reconnect: {}", err);
                }
                period
            }
            Err(err) => {
                warn!("failed to send heartbeat: {}", err);
                period
            }
        }
    }

    /// Runs experiments forever.
    pub async fn run(&self) {
        loop {
            self.run_once().await;
        }
    }

    /// Waits for one experiment, downloads it and trains it.
    ///
    /// Failing to get the experiment pauses for the retry timeout. Training failures are
    /// logged.
    pub async fn run_once(&self) {
        let (experiment, archive) = match self.fetch_experiment().await {
            Ok(fetched) => fetched,
            Err(err) => {
                error!("failed to get experiment: {}", err);
                sleep(self.retry_timeout).await;
                return;
            }
        };

        self.is_experiment_running.store(true, Ordering::SeqCst);
        let span = info_span!("experiment", name = %experiment);
        match self
            .trainer
            .train(&self.name, &experiment, &archive)
            .instrument(span)
            .await
        {
            Ok(()) => info!("experiment {} trained", experiment),
            Err(err) => error!("training of experiment {} failed: {:?}", experiment, err),
        }
        self.is_experiment_running.store(false, Ordering::SeqCst);

        remove_archive(&archive).await;
    }

    async fn fetch_experiment(&self) -> Result<(ExperimentName, PathBuf), ClientError> {
        let experiment = self.client.wait_experiment(&self.name).await?;
        info!("experiment {} assigned", experiment);
        let archive = self
            .workspace
            .join(format!("{}_{}.zip", experiment, Uuid::new_v4()));
        self.client
            .get_experiment_data(&experiment, &self.name, &archive)
            .await?;
        Ok((experiment, archive))
    }
}

async fn remove_archive(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("removed {:?}", path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove {:?}: {}", path, err),
    }
}
