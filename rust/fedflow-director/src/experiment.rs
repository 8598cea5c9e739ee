//! A submitted experiment and its lifecycle.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::review::PlanReviewer;
use fedflow_core::{
    api::ExperimentInfo,
    EnvoyName,
    ExperimentName,
    ExperimentStatus,
    StatusTransitionError,
};

/// One federated training run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Experiment {
    name: ExperimentName,
    archive_path: PathBuf,
    collaborators: Vec<EnvoyName>,
    submitter: Option<String>,
    status: ExperimentStatus,
}

impl Experiment {
    /// Creates a new experiment in [`ExperimentStatus::Pending`].
    pub fn new(
        name: ExperimentName,
        archive_path: impl Into<PathBuf>,
        collaborators: Vec<EnvoyName>,
        submitter: Option<String>,
    ) -> Self {
        Self {
            name,
            archive_path: archive_path.into(),
            collaborators,
            submitter,
            status: ExperimentStatus::Pending,
        }
    }

    pub fn name(&self) -> &ExperimentName {
        &self.name
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// The envoys taking part, in submission order.
    pub fn collaborators(&self) -> &[EnvoyName] {
        &self.collaborators
    }

    pub fn submitter(&self) -> Option<&str> {
        self.submitter.as_deref()
    }

    pub fn status(&self) -> ExperimentStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ExperimentStatus) -> Result<(), StatusTransitionError> {
        self.status.transition(status)
    }

    pub fn info(&self) -> ExperimentInfo {
        ExperimentInfo {
            experiment_name: self.name.clone(),
            status: self.status,
            collaborator_names: self.collaborators.clone(),
        }
    }

    /// Asks `reviewer` whether the experiment may run.
    ///
    /// A rejected experiment moves to [`ExperimentStatus::Rejected`] and its archive is deleted.
    pub async fn review(&mut self, reviewer: &dyn PlanReviewer) -> bool {
        if reviewer.review(self).await {
            info!("experiment {} was accepted", self.name);
            return true;
        }

        info!("experiment {} was rejected", self.name);
        if let Err(err) = self.set_status(ExperimentStatus::Rejected) {
            warn!("{}", err);
        }
        remove_archive(&self.archive_path).await;
        false
    }
}

/// Deletes an archive, ignoring archives that are already gone.
pub(crate) async fn remove_archive(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove archive {}: {}", path.display(), err),
    }
}
