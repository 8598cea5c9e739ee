//! The in-memory store of experiments.
//!
//! Experiments wait in a FIFO queue until the single active slot is free. The control loop takes
//! the head of the queue with [`ExperimentRegistry::acquire_next()`] and holds it through an
//! [`ActiveExperiment`] guard. Dropping the guard archives the experiment and frees the slot, no
//! matter how the caller's work ended.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::experiment::Experiment;
use fedflow_core::{ExperimentName, ExperimentStatus, StatusTransitionError};

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors of the experiment registry.
pub enum RegistryError {
    #[error("experiment {0} is not known")]
    NotFound(ExperimentName),
    #[error("an experiment named {0} already exists")]
    AlreadyExists(ExperimentName),
    #[error("experiment {0} is running")]
    Active(ExperimentName),
}

#[derive(Debug, Default)]
struct RegistryState {
    experiments: HashMap<ExperimentName, Experiment>,
    pending: VecDeque<ExperimentName>,
    active: Option<ExperimentName>,
    /// Most recent first.
    archived: VecDeque<ExperimentName>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<RegistryState>,
    changed: Notify,
}

/// A handle to the experiment registry. Cloning the handle shares the registry.
#[derive(Clone, Debug, Default)]
pub struct ExperimentRegistry {
    inner: Arc<Inner>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // the state is never left half-updated, a panic elsewhere does not invalidate it
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an experiment to the pending queue.
    ///
    /// # Errors
    /// Fails if an experiment of the same name is already known, whatever its status.
    pub fn add(&self, experiment: Experiment) -> Result<(), RegistryError> {
        {
            let mut state = self.state();
            let name = experiment.name().clone();
            if state.experiments.contains_key(&name) {
                return Err(RegistryError::AlreadyExists(name));
            }
            state.experiments.insert(name.clone(), experiment);
            state.pending.push_back(name.clone());
            debug!("experiment {} queued at position {}", name, state.pending.len());
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Waits until no experiment is active and one is pending, then makes the head of the
    /// pending queue the active experiment.
    ///
    /// Concurrent callers are served one at a time: the next call only completes once the
    /// returned guard has been dropped.
    pub async fn acquire_next(&self) -> ActiveExperiment {
        loop {
            // registered before checking so that a concurrent `add` cannot be missed
            let changed = self.inner.changed.notified();
            if let Some(active) = self.try_acquire_next() {
                return active;
            }
            changed.await;
        }
    }

    /// Takes the next experiment if the active slot is free.
    pub fn try_acquire_next(&self) -> Option<ActiveExperiment> {
        let mut state = self.state();
        if state.active.is_some() {
            return None;
        }
        let name = state.pending.pop_front()?;
        let experiment = match state.experiments.get_mut(&name) {
            Some(experiment) => experiment,
            None => {
                warn!("pending experiment {} vanished from the registry", name);
                return None;
            }
        };
        if let Err(err) = experiment.set_status(ExperimentStatus::InProgress) {
            warn!("{}", err);
        }
        let snapshot = experiment.clone();
        state.active = Some(name.clone());
        info!("experiment {} is now active", name);

        Some(ActiveExperiment {
            registry: self.clone(),
            experiment: snapshot,
        })
    }

    pub fn get(&self, name: &ExperimentName) -> Option<Experiment> {
        self.state().experiments.get(name).cloned()
    }

    pub fn contains(&self, name: &ExperimentName) -> bool {
        self.state().experiments.contains_key(name)
    }

    pub fn status(&self, name: &ExperimentName) -> Option<ExperimentStatus> {
        self.state().experiments.get(name).map(Experiment::status)
    }

    /// Looks up where the archive of an experiment is stored.
    pub fn get_archive_path(&self, name: &ExperimentName) -> Result<PathBuf, RegistryError> {
        self.state()
            .experiments
            .get(name)
            .map(|experiment| experiment.archive_path().to_path_buf())
            .ok_or_else(|| RegistryError::NotFound(name.clone()))
    }

    /// The experiments submitted by `user`, in no particular order.
    pub fn user_experiments(&self, user: &str) -> Vec<Experiment> {
        self.state()
            .experiments
            .values()
            .filter(|experiment| experiment.submitter() == Some(user))
            .cloned()
            .collect()
    }

    /// Forgets a pending or archived experiment.
    ///
    /// # Errors
    /// Fails if the experiment is unknown or currently active.
    pub fn remove(&self, name: &ExperimentName) -> Result<Experiment, RegistryError> {
        let mut state = self.state();
        if state.active.as_ref() == Some(name) {
            return Err(RegistryError::Active(name.clone()));
        }
        let experiment = state
            .experiments
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
        state.pending.retain(|pending| pending != name);
        state.archived.retain(|archived| archived != name);
        Ok(experiment)
    }

    pub fn pending(&self) -> Vec<ExperimentName> {
        self.state().pending.iter().cloned().collect()
    }

    pub fn active(&self) -> Option<ExperimentName> {
        self.state().active.clone()
    }

    /// The archived experiments, most recent first.
    pub fn archived(&self) -> Vec<ExperimentName> {
        self.state().archived.iter().cloned().collect()
    }

    fn set_status(
        &self,
        name: &ExperimentName,
        status: ExperimentStatus,
    ) -> Result<(), StatusTransitionError> {
        match self.state().experiments.get_mut(name) {
            Some(experiment) => experiment.set_status(status),
            None => Ok(()),
        }
    }

    fn finish_active(&self, name: &ExperimentName) {
        {
            let mut state = self.state();
            if let Some(experiment) = state.experiments.get_mut(name) {
                if !experiment.status().is_terminal() {
                    warn!("experiment {} ended without an outcome, marking it failed", name);
                    let _ = experiment.set_status(ExperimentStatus::Failed);
                }
                state.archived.push_front(name.clone());
            }
            if state.active.as_ref() == Some(name) {
                state.active = None;
            }
            debug!("experiment {} archived", name);
        }
        self.inner.changed.notify_waiters();
    }
}

/// The experiment currently holding the active slot.
///
/// Dropping the guard archives the experiment and frees the slot. An experiment
/// that has not reached a terminal status at that point is marked [`ExperimentStatus::Failed`].
#[derive(Debug)]
pub struct ActiveExperiment {
    registry: ExperimentRegistry,
    experiment: Experiment,
}

impl ActiveExperiment {
    /// The experiment as it was when it became active.
    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn name(&self) -> &ExperimentName {
        self.experiment.name()
    }

    /// Records the outcome of the experiment.
    pub fn set_status(&mut self, status: ExperimentStatus) -> Result<(), StatusTransitionError> {
        self.registry.set_status(self.experiment.name(), status)?;
        self.experiment.set_status(status)
    }
}

impl Drop for ActiveExperiment {
    fn drop(&mut self) {
        self.registry.finish_active(self.experiment.name());
    }
}
