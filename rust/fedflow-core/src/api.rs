//! Request and response bodies of the director API.
//!
//! Control messages are exchanged as JSON. Archives travel as a stream of frames, see
//! [`crate::transfer`].

use serde::{Deserialize, Serialize};

use crate::{EnvoyName, ExperimentName, ExperimentStatus};

/// The request header carrying the caller identity when TLS client authentication is off.
pub const CLIENT_ID_HEADER: &str = "client_id";

/// The identity assumed for callers that do not send a [`CLIENT_ID_HEADER`].
pub const DEFAULT_CLIENT_ID: &str = "__default__";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEnvoyRequest {
    pub envoy_name: EnvoyName,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEnvoyResponse {
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEnvoyStatusRequest {
    pub envoy_name: EnvoyName,
    pub is_experiment_running: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEnvoyStatusResponse {
    /// The period in seconds after which the envoy is expected to send its next heartbeat.
    pub health_check_period: u64,
}

/// A snapshot of what the director knows about an envoy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvoyInfo {
    pub envoy_name: EnvoyName,
    pub is_online: bool,
    pub is_experiment_running: bool,
    /// Seconds elapsed since the last heartbeat.
    pub last_updated_secs: u64,
    /// Seconds a heartbeat keeps the envoy online.
    pub valid_duration_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitExperimentRequest {
    pub collaborator_name: EnvoyName,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitExperimentResponse {
    pub experiment_name: ExperimentName,
}

/// Query string of an archive download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentDataQuery {
    pub collaborator_name: EnvoyName,
}

/// The metadata sent in the first frame of an experiment upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub experiment_name: ExperimentName,
    pub collaborator_names: Vec<EnvoyName>,
}

impl ExperimentMetadata {
    /// Serializes the metadata into the payload of a frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserializes the metadata from the payload of a frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNewExperimentResponse {
    /// `false` if the experiment was not admitted.
    pub status: bool,
}

/// The outcome of the most recently completed flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub completed: bool,
    pub serialized_result: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub experiment_name: ExperimentName,
    pub status: ExperimentStatus,
    pub collaborator_names: Vec<EnvoyName>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveExperimentResponse {
    pub removed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_frame_payload() {
        let metadata = ExperimentMetadata {
            experiment_name: "exp1".into(),
            collaborator_names: vec!["w1".into(), "w2".into()],
        };
        let bytes = metadata.to_bytes().unwrap();
        assert_eq!(ExperimentMetadata::from_bytes(&bytes).unwrap(), metadata);
        assert!(ExperimentMetadata::from_bytes(&bytes[..3]).is_err());
    }

    #[test]
    fn test_envoy_name_is_transparent() {
        let request = ConnectEnvoyRequest {
            envoy_name: "w1".into(),
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"envoy_name":"w1"}"#
        );
    }
}
