//! Execution of experiments by an external aggregator.

use std::{path::PathBuf, process::Stdio};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::experiment::Experiment;
use fedflow_core::ExperimentStatus;

/// The TLS material handed to the aggregator so that envoys can reach it the same way they
/// reach the director.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub tls: bool,
    pub root_certificate: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

/// How an execution ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Either [`ExperimentStatus::Finished`] or [`ExperimentStatus::Failed`].
    pub status: ExperimentStatus,
    /// The serialized flow, as reported by the aggregator.
    pub serialized_result: Vec<u8>,
}

impl ExecutionOutcome {
    pub fn finished(serialized_result: Vec<u8>) -> Self {
        Self {
            status: ExperimentStatus::Finished,
            serialized_result,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: ExperimentStatus::Failed,
            serialized_result: Vec::new(),
        }
    }
}

/// Runs an experiment to completion.
///
/// An error is an execution failure. It fails the experiment but never the control loop.
#[async_trait]
pub trait ExperimentRunner: Send + Sync + 'static {
    async fn start(
        &self,
        security: &SecurityContext,
        experiment: &Experiment,
    ) -> Result<ExecutionOutcome, anyhow::Error>;
}

/// Spawns an aggregator process per experiment.
///
/// The process learns about the experiment from its environment:
///
/// | variable | value |
/// |----------|-------|
/// | `FEDFLOW_EXPERIMENT_NAME` | name of the experiment |
/// | `FEDFLOW_EXPERIMENT_ARCHIVE` | path of the uploaded archive |
/// | `FEDFLOW_COLLABORATORS` | comma separated envoy names |
/// | `FEDFLOW_TLS` | `true` or `false` |
/// | `FEDFLOW_ROOT_CERTIFICATE`, `FEDFLOW_CERTIFICATE`, `FEDFLOW_PRIVATE_KEY` | TLS paths, if any |
///
/// Exit status `0` finishes the experiment, anything else fails it. Whatever the process
/// writes to stdout is kept as the serialized flow.
#[derive(Clone, Debug)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, security: &SecurityContext, experiment: &Experiment) -> Command {
        let collaborators = experiment
            .collaborators()
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("FEDFLOW_EXPERIMENT_NAME", experiment.name().as_str())
            .env("FEDFLOW_EXPERIMENT_ARCHIVE", experiment.archive_path())
            .env("FEDFLOW_COLLABORATORS", collaborators)
            .env("FEDFLOW_TLS", security.tls.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, path) in &[
            ("FEDFLOW_ROOT_CERTIFICATE", &security.root_certificate),
            ("FEDFLOW_CERTIFICATE", &security.certificate),
            ("FEDFLOW_PRIVATE_KEY", &security.private_key),
        ] {
            if let Some(path) = path {
                command.env(key, path);
            }
        }
        command
    }
}

#[async_trait]
impl ExperimentRunner for CommandRunner {
    async fn start(
        &self,
        security: &SecurityContext,
        experiment: &Experiment,
    ) -> Result<ExecutionOutcome, anyhow::Error> {
        info!("spawning aggregator `{}`", self.program);
        let output = self
            .command(security, experiment)
            .output()
            .await
            .with_context(|| format!("failed to run aggregator `{}`", self.program))?;
        debug!("aggregator exited with {}", output.status);

        if output.status.success() {
            Ok(ExecutionOutcome::finished(output.stdout))
        } else {
            Ok(ExecutionOutcome::failed())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn experiment() -> Experiment {
        Experiment::new(
            "exp1".into(),
            "/tmp/exp1.zip",
            vec!["w1".into(), "w2".into()],
            None,
        )
    }

    fn shell(script: &str) -> CommandRunner {
        CommandRunner::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_successful_aggregator() {
        let runner = shell("printf '%s|%s' \"$FEDFLOW_EXPERIMENT_NAME\" \"$FEDFLOW_COLLABORATORS\"");
        let outcome = runner
            .start(&SecurityContext::default(), &experiment())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExperimentStatus::Finished);
        assert_eq!(outcome.serialized_result, b"exp1|w1,w2".to_vec());
    }

    #[tokio::test]
    async fn test_failing_aggregator() {
        let outcome = shell("exit 3")
            .start(&SecurityContext::default(), &experiment())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::failed());
    }

    #[tokio::test]
    async fn test_missing_aggregator() {
        let runner = CommandRunner::new("/nonexistent/aggregator", vec![]);
        assert!(runner
            .start(&SecurityContext::default(), &experiment())
            .await
            .is_err());
    }
}
