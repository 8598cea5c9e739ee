use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The name of an envoy. Envoys are identified by the name they connect with.
#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EnvoyName(String);

impl EnvoyName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EnvoyName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The longest experiment name accepted by [`ExperimentName::is_valid`].
pub const MAX_EXPERIMENT_NAME_LEN: usize = 128;

/// The unique name of an experiment, chosen by its submitter.
///
/// Names travel as a URL path segment, so a director only admits names that are valid
/// according to [`ExperimentName::is_valid`].
#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ExperimentName(String);

impl ExperimentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks whether the name starts with an ASCII letter or digit, continues with ASCII
    /// letters, digits, `_`, `-` or `.` only, and is at most [`MAX_EXPERIMENT_NAME_LEN`] bytes
    /// long.
    pub fn is_valid(&self) -> bool {
        let mut chars = self.0.chars();
        let starts_well = chars
            .next()
            .map_or(false, |first| first.is_ascii_alphanumeric());
        starts_well
            && self.0.len() <= MAX_EXPERIMENT_NAME_LEN
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }
}

impl From<&str> for ExperimentName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The status of an experiment.
///
/// ```text
///            +-------------+     +----------+
/// PENDING -->| IN_PROGRESS |---->| FINISHED |
///    |       +-------------+  |  +----------+
///    |                        |  +----------+
///    |                        +->|  FAILED  |
///    |                           +----------+
///    |                           +----------+
///    +-------------------------->| REJECTED |
///                                +----------+
/// ```
///
/// Transitions only move forward, there is no way out of a terminal status.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    #[display(fmt = "PENDING")]
    Pending,
    #[display(fmt = "IN_PROGRESS")]
    InProgress,
    #[display(fmt = "FINISHED")]
    Finished,
    #[display(fmt = "FAILED")]
    Failed,
    #[display(fmt = "REJECTED")]
    Rejected,
}

impl ExperimentStatus {
    /// Checks whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Rejected)
    }

    /// Checks whether moving from `self` to `next` is a valid transition.
    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Rejected) | (InProgress, Finished) | (InProgress, Failed)
        )
    }

    /// Moves to the `next` status.
    ///
    /// # Errors
    /// Fails if the transition would go backwards or leave a terminal status.
    pub fn transition(&mut self, next: ExperimentStatus) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(StatusTransitionError {
                from: *self,
                to: next,
            })
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid experiment status transition from {from} to {to}")]
/// An attempt to move an experiment to a status it cannot reach.
pub struct StatusTransitionError {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_name_validity() {
        for name in &["mnist", "exp1", "mnist_v2.1-final", "9lives"] {
            assert!(ExperimentName::from(*name).is_valid(), "{}", name);
        }
        for name in &["", "mnist exp", "team/exp1", "exp#2", "a?b", "..", ".hidden", "-x", "ünï"] {
            assert!(!ExperimentName::from(*name).is_valid(), "{}", name);
        }
        assert!(ExperimentName::new("a".repeat(MAX_EXPERIMENT_NAME_LEN)).is_valid());
        assert!(!ExperimentName::new("a".repeat(MAX_EXPERIMENT_NAME_LEN + 1)).is_valid());
    }

    #[test]
    fn test_forward_transitions() {
        let mut status = ExperimentStatus::Pending;
        assert!(status.transition(ExperimentStatus::InProgress).is_ok());
        assert!(status.transition(ExperimentStatus::Finished).is_ok());
        assert_eq!(status, ExperimentStatus::Finished);
    }

    #[test]
    fn test_no_transition_out_of_terminal_status() {
        for terminal in &[
            ExperimentStatus::Finished,
            ExperimentStatus::Failed,
            ExperimentStatus::Rejected,
        ] {
            assert!(terminal.is_terminal());
            for next in &[
                ExperimentStatus::Pending,
                ExperimentStatus::InProgress,
                ExperimentStatus::Finished,
                ExperimentStatus::Failed,
                ExperimentStatus::Rejected,
            ] {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn test_backward_transition_fails() {
        let mut status = ExperimentStatus::InProgress;
        let err = status.transition(ExperimentStatus::Pending).unwrap_err();
        assert_eq!(
            err,
            StatusTransitionError {
                from: ExperimentStatus::InProgress,
                to: ExperimentStatus::Pending
            }
        );
        assert_eq!(status, ExperimentStatus::InProgress);
        assert!(!ExperimentStatus::InProgress.can_transition_to(ExperimentStatus::Rejected));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExperimentStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert_eq!(ExperimentStatus::Failed.to_string(), "FAILED");
    }
}
