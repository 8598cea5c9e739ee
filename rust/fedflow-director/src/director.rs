//! The director: admission of experiments, the control loop running them one at a time and
//! the protocol handing them out to envoys.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::{
    assignments::AssignmentQueues,
    envoys::EnvoyTracker,
    experiment::{remove_archive, Experiment},
    registry::{ExperimentRegistry, RegistryError},
    review::PlanReviewer,
    runner::{ExecutionOutcome, ExperimentRunner, SecurityContext},
};
use fedflow_core::{
    api::{EnvoyInfo, ExperimentInfo, FlowStatus},
    EnvoyName,
    ExperimentName,
    ExperimentStatus,
};

/// The health check period used when none is configured.
pub const DEFAULT_HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors of the director operations.
pub enum DirectorError {
    #[error("experiment {0} is not known")]
    ExperimentNotFound(ExperimentName),
    #[error("envoy {0} is not known")]
    EnvoyNotFound(EnvoyName),
    #[error("experiment {0} already exists")]
    ExperimentExists(ExperimentName),
    #[error("experiment {0} is running")]
    ExperimentActive(ExperimentName),
    #[error("experiment {0} was submitted by another user")]
    NotSubmitter(ExperimentName),
}

impl DirectorError {
    /// Checks whether the error names something the director does not know.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ExperimentNotFound(_) | Self::EnvoyNotFound(_))
    }
}

impl From<RegistryError> for DirectorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => Self::ExperimentNotFound(name),
            RegistryError::AlreadyExists(name) => Self::ExperimentExists(name),
            RegistryError::Active(name) => Self::ExperimentActive(name),
        }
    }
}

struct Inner {
    registry: ExperimentRegistry,
    envoys: EnvoyTracker,
    assignments: AssignmentQueues,
    /// The experiment each envoy was last handed.
    current: Mutex<HashMap<EnvoyName, ExperimentName>>,
    runner: Arc<dyn ExperimentRunner>,
    reviewer: Option<Arc<dyn PlanReviewer>>,
    security: SecurityContext,
    flows: broadcast::Sender<FlowStatus>,
}

/// Builds a [`Director`].
pub struct DirectorBuilder {
    runner: Arc<dyn ExperimentRunner>,
    reviewer: Option<Arc<dyn PlanReviewer>>,
    security: SecurityContext,
    health_check_period: Duration,
}

impl DirectorBuilder {
    pub fn health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    /// Reviews every submitted experiment before it is queued.
    pub fn reviewer(mut self, reviewer: Arc<dyn PlanReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn security(mut self, security: SecurityContext) -> Self {
        self.security = security;
        self
    }

    pub fn build(self) -> Director {
        let (flows, _) = broadcast::channel(16);
        Director {
            inner: Arc::new(Inner {
                registry: ExperimentRegistry::new(),
                envoys: EnvoyTracker::new(self.health_check_period),
                assignments: AssignmentQueues::new(),
                current: Mutex::new(HashMap::new()),
                runner: self.runner,
                reviewer: self.reviewer,
                security: self.security,
                flows,
            }),
        }
    }
}

/// A handle to the director. Cloning the handle shares the director.
#[derive(Clone)]
pub struct Director {
    inner: Arc<Inner>,
}

impl Director {
    pub fn builder(runner: Arc<dyn ExperimentRunner>) -> DirectorBuilder {
        DirectorBuilder {
            runner,
            reviewer: None,
            security: SecurityContext::default(),
            health_check_period: DEFAULT_HEALTH_CHECK_PERIOD,
        }
    }

    pub fn registry(&self) -> &ExperimentRegistry {
        &self.inner.registry
    }

    pub fn envoys(&self) -> &EnvoyTracker {
        &self.inner.envoys
    }

    pub fn assignments(&self) -> &AssignmentQueues {
        &self.inner.assignments
    }

    pub fn health_check_period(&self) -> Duration {
        self.inner.envoys.health_check_period()
    }

    fn current(&self) -> MutexGuard<'_, HashMap<EnvoyName, ExperimentName>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs experiments forever, one after the other.
    pub async fn start_experiment_execution_loop(&self) {
        info!("experiment execution loop started");
        loop {
            self.run_next().await;
        }
    }

    /// Waits for the next experiment, runs it and returns its final status.
    ///
    /// Execution failures, panics included, fail the experiment and are not propagated.
    pub async fn run_next(&self) -> ExperimentStatus {
        let mut active = self.inner.registry.acquire_next().await;
        let experiment = active.experiment().clone();
        let span = info_span!("experiment", name = %experiment.name());

        async {
            info!("starting experiment");
            let execution = self.inner.runner.start(&self.inner.security, &experiment);
            for envoy in experiment.collaborators() {
                self.inner
                    .assignments
                    .push(envoy, experiment.name().clone());
            }
            debug!(
                "experiment assigned to {} envoys",
                experiment.collaborators().len()
            );

            let outcome = match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    error!("experiment execution failed: {:?}", err);
                    ExecutionOutcome::failed()
                }
                Err(_) => {
                    error!("experiment execution panicked");
                    ExecutionOutcome::failed()
                }
            };

            let status = match active.set_status(outcome.status) {
                Ok(()) => outcome.status,
                Err(err) => {
                    warn!("{}, marking the experiment failed", err);
                    let _ = active.set_status(ExperimentStatus::Failed);
                    ExperimentStatus::Failed
                }
            };
            // archives the experiment and frees the slot
            drop(active);
            info!("experiment ended with status {}", status);

            let _ = self.inner.flows.send(FlowStatus {
                completed: status == ExperimentStatus::Finished,
                serialized_result: outcome.serialized_result,
            });
            status
        }
        .instrument(span)
        .await
    }

    /// Admits a new experiment.
    ///
    /// Returns `false` if the experiment was not queued, because its name is invalid or taken
    /// or because the plan review rejected it. Its archive is deleted in all these cases.
    pub async fn set_new_experiment(
        &self,
        name: ExperimentName,
        collaborators: Vec<EnvoyName>,
        archive_path: PathBuf,
        submitter: Option<String>,
    ) -> bool {
        let mut experiment = Experiment::new(name, archive_path, collaborators, submitter);
        if !experiment.name().is_valid() {
            warn!("experiment name {:?} is not valid", experiment.name().as_str());
            remove_archive(experiment.archive_path()).await;
            return false;
        }
        if self.inner.registry.contains(experiment.name()) {
            warn!("experiment {} already exists", experiment.name());
            remove_archive(experiment.archive_path()).await;
            return false;
        }

        if let Some(reviewer) = &self.inner.reviewer {
            if !experiment.review(reviewer.as_ref()).await {
                return false;
            }
        }

        let archive_path = experiment.archive_path().to_path_buf();
        match self.inner.registry.add(experiment) {
            Ok(()) => true,
            Err(err) => {
                warn!("{}", err);
                remove_archive(&archive_path).await;
                false
            }
        }
    }

    /// Waits for the experiment `envoy` should run.
    ///
    /// An envoy asking again while its experiment is still in progress gets the same name back.
    /// Queued assignments of experiments that are no longer in progress, or that no longer list
    /// the envoy as a collaborator, are skipped.
    pub async fn wait_experiment(&self, envoy: &EnvoyName) -> ExperimentName {
        let current = self.current().get(envoy).cloned();
        if let Some(name) = current {
            if self.is_assigned(&name, envoy) {
                debug!("envoy {} is still assigned to {}", envoy, name);
                return name;
            }
            self.current().remove(envoy);
        }

        loop {
            let name = self.inner.assignments.pop(envoy).await;
            if self.is_assigned(&name, envoy) {
                info!("experiment {} handed to envoy {}", name, envoy);
                self.current().insert(envoy.clone(), name.clone());
                return name;
            }
            debug!("skipping stale assignment {} of envoy {}", name, envoy);
        }
    }

    /// Checks whether `name` is in progress with `envoy` among its collaborators.
    fn is_assigned(&self, name: &ExperimentName, envoy: &EnvoyName) -> bool {
        self.inner
            .registry
            .get(name)
            .map(|experiment| {
                experiment.status() == ExperimentStatus::InProgress
                    && experiment.collaborators().contains(envoy)
            })
            .unwrap_or(false)
    }

    pub fn acknowledge(&self, envoy: &EnvoyName) -> bool {
        self.inner.envoys.acknowledge(envoy)
    }

    /// Records a heartbeat and returns the health check period.
    ///
    /// # Errors
    /// Fails with [`DirectorError::EnvoyNotFound`] if the envoy never connected.
    pub fn update_status(
        &self,
        envoy: &EnvoyName,
        is_experiment_running: bool,
    ) -> Result<Duration, DirectorError> {
        self.inner
            .envoys
            .update_status(envoy, is_experiment_running)
    }

    pub fn get_envoys(&self) -> Vec<EnvoyInfo> {
        self.inner.envoys.envoys()
    }

    /// Looks up the archive of an experiment.
    pub fn get_experiment_data(&self, name: &ExperimentName) -> Result<PathBuf, DirectorError> {
        Ok(self.inner.registry.get_archive_path(name)?)
    }

    pub fn get_experiment_status(
        &self,
        name: &ExperimentName,
    ) -> Result<ExperimentStatus, DirectorError> {
        self.inner
            .registry
            .status(name)
            .ok_or_else(|| DirectorError::ExperimentNotFound(name.clone()))
    }

    /// The experiments submitted by `user`, sorted by name.
    pub fn get_user_experiments(&self, user: &str) -> Vec<ExperimentInfo> {
        let mut experiments: Vec<ExperimentInfo> = self
            .inner
            .registry
            .user_experiments(user)
            .iter()
            .map(Experiment::info)
            .collect();
        experiments.sort_by(|a, b| a.experiment_name.cmp(&b.experiment_name));
        experiments
    }

    /// Removes a pending or archived experiment of `user` together with its archive.
    pub async fn remove_experiment(
        &self,
        name: &ExperimentName,
        user: &str,
    ) -> Result<(), DirectorError> {
        let experiment = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| DirectorError::ExperimentNotFound(name.clone()))?;
        if experiment.submitter() != Some(user) {
            return Err(DirectorError::NotSubmitter(name.clone()));
        }
        let experiment = self.inner.registry.remove(name)?;
        let dropped = self.inner.assignments.purge(name);
        self.current().retain(|_, current| *current != *name);
        if dropped > 0 {
            debug!("dropped {} queued assignments of {}", dropped, name);
        }
        remove_archive(experiment.archive_path()).await;
        info!("experiment {} removed", name);
        Ok(())
    }

    /// Waits for the next experiment to end and returns its flow status.
    pub async fn get_flow_status(&self) -> FlowStatus {
        let mut flows = self.inner.flows.subscribe();
        loop {
            match flows.recv().await {
                Ok(status) => return status,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                // the sender lives as long as the director
                Err(broadcast::error::RecvError::Closed) => return FlowStatus::default(),
            }
        }
    }

    /// Marks envoys that missed their heartbeats as offline, once per health check period.
    pub async fn run_liveness_sweep(&self) {
        let mut interval = tokio::time::interval(self.health_check_period());
        loop {
            interval.tick().await;
            self.inner.envoys.expire_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::oneshot;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    type Gate = oneshot::Receiver<Result<ExecutionOutcome, String>>;

    /// Ends each experiment when the test says so. Panics for experiments without a gate.
    #[derive(Default)]
    struct GatedRunner {
        gates: Mutex<HashMap<ExperimentName, Gate>>,
    }

    impl GatedRunner {
        fn gate(&self, name: &str) -> oneshot::Sender<Result<ExecutionOutcome, String>> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(name.into(), rx);
            tx
        }
    }

    #[async_trait]
    impl ExperimentRunner for GatedRunner {
        async fn start(
            &self,
            _security: &SecurityContext,
            experiment: &Experiment,
        ) -> Result<ExecutionOutcome, anyhow::Error> {
            let gate = self.gates.lock().unwrap().remove(experiment.name());
            match gate {
                Some(gate) => match gate.await {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(msg)) => Err(anyhow!(msg)),
                    Err(_) => Err(anyhow!("gate dropped")),
                },
                None => panic!("no gate for {}", experiment.name()),
            }
        }
    }

    fn setup() -> (Director, Arc<GatedRunner>, tempfile::TempDir) {
        let runner = Arc::new(GatedRunner::default());
        let director = Director::builder(runner.clone()).build();
        (director, runner, tempfile::tempdir().unwrap())
    }

    fn archive(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(format!("{}.zip", name));
        std::fs::write(&path, name).unwrap();
        path
    }

    fn envoys(names: &[&str]) -> Vec<EnvoyName> {
        names.iter().map(|name| EnvoyName::from(*name)).collect()
    }

    #[tokio::test]
    async fn test_experiment_lifecycle() {
        let (director, runner, dir) = setup();
        let gate = runner.gate("exp1");
        let (w1, w2) = (EnvoyName::from("w1"), EnvoyName::from("w2"));

        assert!(
            director
                .set_new_experiment(
                    "exp1".into(),
                    envoys(&["w1", "w2"]),
                    archive(&dir, "exp1"),
                    Some("alice".into()),
                )
                .await
        );
        assert_eq!(
            director.get_experiment_status(&"exp1".into()),
            Ok(ExperimentStatus::Pending)
        );

        let mut flow = task::spawn(director.get_flow_status());
        assert_pending!(flow.poll());

        let looped = director.clone();
        let control = tokio::spawn(async move { looped.run_next().await });

        assert_eq!(director.wait_experiment(&w1).await.as_str(), "exp1");
        assert_eq!(director.registry().active(), Some("exp1".into()));
        assert_eq!(
            director.assignments().snapshot(&w2),
            vec![ExperimentName::from("exp1")]
        );

        // asking again while the experiment runs consumes nothing
        assert_eq!(director.wait_experiment(&w1).await.as_str(), "exp1");
        assert_eq!(director.wait_experiment(&w2).await.as_str(), "exp1");
        assert_eq!(director.wait_experiment(&w2).await.as_str(), "exp1");
        assert!(director.assignments().snapshot(&w1).is_empty());
        assert!(director.assignments().snapshot(&w2).is_empty());

        gate.send(Ok(ExecutionOutcome::finished(b"flow".to_vec())))
            .unwrap();
        assert_eq!(control.await.unwrap(), ExperimentStatus::Finished);

        assert_eq!(director.registry().active(), None);
        assert_eq!(
            director.registry().archived(),
            vec![ExperimentName::from("exp1")]
        );
        assert_eq!(
            director.get_experiment_status(&"exp1".into()),
            Ok(ExperimentStatus::Finished)
        );
        assert!(flow.is_woken());
        assert_eq!(
            assert_ready!(flow.poll()),
            FlowStatus {
                completed: true,
                serialized_result: b"flow".to_vec()
            }
        );

        // the finished experiment is no longer handed out
        let mut next = task::spawn(director.wait_experiment(&w1));
        assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn test_failed_execution_does_not_stop_the_loop() {
        let (director, runner, dir) = setup();
        let gate = runner.gate("broken");
        let fine_gate = runner.gate("fine");
        for name in &["broken", "fine"] {
            assert!(
                director
                    .set_new_experiment((*name).into(), envoys(&["w1"]), archive(&dir, name), None)
                    .await
            );
        }

        gate.send(Err("aggregator crashed".into())).unwrap();
        assert_eq!(director.run_next().await, ExperimentStatus::Failed);
        assert_eq!(director.registry().active(), None);
        assert_eq!(director.registry().pending(), vec![ExperimentName::from("fine")]);

        let looped = director.clone();
        let control = tokio::spawn(async move { looped.run_next().await });
        assert_eq!(director.wait_experiment(&"w1".into()).await.as_str(), "fine");
        drop(fine_gate);
        assert_eq!(control.await.unwrap(), ExperimentStatus::Failed);
    }

    #[tokio::test]
    async fn test_panicking_execution_is_contained() {
        let (director, _runner, dir) = setup();
        assert!(
            director
                .set_new_experiment("nogate".into(), envoys(&["w1"]), archive(&dir, "nogate"), None)
                .await
        );
        assert_eq!(director.run_next().await, ExperimentStatus::Failed);
        assert_eq!(
            director.registry().archived(),
            vec![ExperimentName::from("nogate")]
        );
    }

    #[tokio::test]
    async fn test_stale_assignment_is_skipped() {
        let (director, runner, dir) = setup();
        let gate = runner.gate("exp1");
        director
            .set_new_experiment("exp1".into(), envoys(&["w1", "w2"]), archive(&dir, "exp1"), None)
            .await;

        gate.send(Ok(ExecutionOutcome::finished(Vec::new()))).unwrap();
        assert_eq!(director.run_next().await, ExperimentStatus::Finished);

        let w2 = EnvoyName::from("w2");
        assert_eq!(
            director.assignments().snapshot(&w2),
            vec![ExperimentName::from("exp1")]
        );
        let mut wait = task::spawn(director.wait_experiment(&w2));
        assert_pending!(wait.poll());
        assert!(director.assignments().snapshot(&w2).is_empty());
    }

    #[tokio::test]
    async fn test_resubmitted_name_reaches_only_new_collaborators() {
        let (director, runner, dir) = setup();
        let gate = runner.gate("exp");
        director
            .set_new_experiment(
                "exp".into(),
                envoys(&["w1", "w3"]),
                archive(&dir, "first"),
                Some("alice".into()),
            )
            .await;
        gate.send(Ok(ExecutionOutcome::finished(Vec::new()))).unwrap();
        assert_eq!(director.run_next().await, ExperimentStatus::Finished);

        let w3 = EnvoyName::from("w3");
        assert_eq!(
            director.assignments().snapshot(&w3),
            vec![ExperimentName::from("exp")]
        );
        assert_eq!(
            director.remove_experiment(&"exp".into(), "alice").await,
            Ok(())
        );
        assert!(director.assignments().snapshot(&w3).is_empty());

        let gate = runner.gate("exp");
        assert!(
            director
                .set_new_experiment(
                    "exp".into(),
                    envoys(&["w1"]),
                    archive(&dir, "second"),
                    Some("alice".into()),
                )
                .await
        );
        let looped = director.clone();
        let control = tokio::spawn(async move { looped.run_next().await });

        assert_eq!(director.wait_experiment(&"w1".into()).await.as_str(), "exp");
        let mut wait = task::spawn(director.wait_experiment(&w3));
        assert_pending!(wait.poll());

        gate.send(Ok(ExecutionOutcome::finished(Vec::new()))).unwrap();
        assert_eq!(control.await.unwrap(), ExperimentStatus::Finished);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let (director, _runner, dir) = setup();
        let first = archive(&dir, "first");
        let second = archive(&dir, "second");

        assert!(
            director
                .set_new_experiment("exp1".into(), envoys(&["w1"]), first.clone(), None)
                .await
        );
        assert!(
            !director
                .set_new_experiment("exp1".into(), envoys(&["w2"]), second.clone(), None)
                .await
        );
        assert!(first.exists());
        assert!(!second.exists());
        assert_eq!(director.registry().pending().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let (director, _runner, dir) = setup();
        let path = archive(&dir, "spaced");

        assert!(
            !director
                .set_new_experiment("mnist exp".into(), envoys(&["w1"]), path.clone(), None)
                .await
        );
        assert!(!path.exists());
        assert!(director.registry().pending().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_plan_is_never_queued() {
        let runner = Arc::new(GatedRunner::default());
        let reviewer = |experiment: &Experiment| experiment.name().as_str() != "evil";
        let director = Director::builder(runner)
            .reviewer(Arc::new(reviewer))
            .build();
        let dir = tempfile::tempdir().unwrap();
        let path = archive(&dir, "evil");

        assert!(
            !director
                .set_new_experiment("evil".into(), envoys(&["w1"]), path.clone(), None)
                .await
        );
        assert!(!path.exists());
        assert!(!director.registry().contains(&"evil".into()));
        assert!(director.registry().pending().is_empty());

        assert!(
            director
                .set_new_experiment("good".into(), envoys(&["w1"]), archive(&dir, "good"), None)
                .await
        );
    }

    #[tokio::test]
    async fn test_envoy_liveness_api() {
        let (director, _runner, _dir) = setup();
        let w1 = EnvoyName::from("w1");

        assert_eq!(
            director.update_status(&w1, false),
            Err(DirectorError::EnvoyNotFound(w1.clone()))
        );
        assert!(director.acknowledge(&w1));
        assert_eq!(
            director.update_status(&w1, false),
            Ok(DEFAULT_HEALTH_CHECK_PERIOD)
        );
        assert_eq!(director.get_envoys()[0].envoy_name, w1);
    }

    #[tokio::test]
    async fn test_experiment_queries_and_removal() {
        let (director, _runner, dir) = setup();
        let path = archive(&dir, "exp1");
        director
            .set_new_experiment("exp1".into(), envoys(&["w1"]), path.clone(), Some("alice".into()))
            .await;

        assert_eq!(
            director.get_experiment_data(&"exp1".into()),
            Ok(path.clone())
        );
        assert!(director
            .get_experiment_data(&"nope".into())
            .unwrap_err()
            .is_not_found());
        assert_eq!(director.get_user_experiments("alice").len(), 1);
        assert!(director.get_user_experiments("bob").is_empty());

        assert_eq!(
            director.remove_experiment(&"exp1".into(), "bob").await,
            Err(DirectorError::NotSubmitter("exp1".into()))
        );
        assert_eq!(
            director.remove_experiment(&"exp1".into(), "alice").await,
            Ok(())
        );
        assert!(!path.exists());
        assert!(!director.registry().contains(&"exp1".into()));
    }
}
