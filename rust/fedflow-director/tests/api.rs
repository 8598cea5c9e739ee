use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use warp::http::StatusCode;

use fedflow_core::{
    api::{
        ConnectEnvoyRequest,
        ConnectEnvoyResponse,
        EnvoyInfo,
        ExperimentInfo,
        ExperimentMetadata,
        SetNewExperimentResponse,
        UpdateEnvoyStatusRequest,
        UpdateEnvoyStatusResponse,
        WaitExperimentRequest,
        WaitExperimentResponse,
        CLIENT_ID_HEADER,
    },
    transfer::{metadata_frame, Chunk, Chunker, FrameDecoder},
    ExperimentStatus,
};
use fedflow_director::{
    experiment::Experiment,
    rest::{routes, IdentitySource},
    runner::{ExecutionOutcome, ExperimentRunner, SecurityContext},
    workspace::ArchiveWorkspace,
    Director,
};

/// Runs until the test ends.
struct EndlessRunner;

#[async_trait]
impl ExperimentRunner for EndlessRunner {
    async fn start(
        &self,
        _security: &SecurityContext,
        _experiment: &Experiment,
    ) -> Result<ExecutionOutcome, anyhow::Error> {
        futures::future::pending().await
    }
}

async fn setup() -> (Director, ArchiveWorkspace, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let workspace = ArchiveWorkspace::create(dir.path()).await.unwrap();
    let director = Director::builder(Arc::new(EndlessRunner)).build();
    (director, workspace, dir)
}

fn upload(name: &str, collaborators: &[&str], archive: &[u8], chunk_size: usize) -> Bytes {
    let metadata = ExperimentMetadata {
        experiment_name: name.into(),
        collaborator_names: collaborators.iter().map(|c| (*c).into()).collect(),
    };
    let mut body = BytesMut::new();
    body.extend_from_slice(&metadata_frame(&metadata).unwrap());
    for frame in Chunker::new(&archive, chunk_size).frames() {
        body.extend_from_slice(&frame);
    }
    body.freeze()
}

fn decode(body: &[u8]) -> Vec<u8> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(body);
    let mut archive = Vec::new();
    while let Some(chunk) = decoder.decode().unwrap() {
        chunk.verify().unwrap();
        archive.extend_from_slice(&chunk.data);
    }
    decoder.finish().unwrap();
    archive
}

#[tokio::test]
async fn test_heartbeat_requires_connect() {
    let (director, workspace, _dir) = setup().await;
    let api = routes(director, workspace, IdentitySource::Header);
    let heartbeat = UpdateEnvoyStatusRequest {
        envoy_name: "w1".into(),
        is_experiment_running: false,
    };

    let response = warp::test::request()
        .method("POST")
        .path("/envoys/status")
        .json(&heartbeat)
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = warp::test::request()
        .method("POST")
        .path("/envoys/connect")
        .json(&ConnectEnvoyRequest {
            envoy_name: "w1".into(),
        })
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let connected: ConnectEnvoyResponse = serde_json::from_slice(response.body()).unwrap();
    assert!(connected.accepted);

    let response = warp::test::request()
        .method("POST")
        .path("/envoys/status")
        .json(&heartbeat)
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let status: UpdateEnvoyStatusResponse = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(status.health_check_period, 60);

    let response = warp::test::request().path("/envoys").reply(&api).await;
    let envoys: Vec<EnvoyInfo> = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(envoys.len(), 1);
    assert!(envoys[0].is_online);
}

#[tokio::test]
async fn test_upload_and_download() {
    let (director, workspace, _dir) = setup().await;
    let api = routes(director.clone(), workspace, IdentitySource::Header);
    let archive: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let response = warp::test::request()
        .method("POST")
        .path("/experiments")
        .header(CLIENT_ID_HEADER, "alice")
        .body(upload("exp1", &["w1"], &archive, 30_000))
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let submitted: SetNewExperimentResponse = serde_json::from_slice(response.body()).unwrap();
    assert!(submitted.status);

    let response = warp::test::request()
        .path("/experiments")
        .header(CLIENT_ID_HEADER, "alice")
        .reply(&api)
        .await;
    let experiments: Vec<ExperimentInfo> = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0].status, ExperimentStatus::Pending);

    // another caller sees nothing
    let response = warp::test::request().path("/experiments").reply(&api).await;
    let experiments: Vec<ExperimentInfo> = serde_json::from_slice(response.body()).unwrap();
    assert!(experiments.is_empty());

    let response = warp::test::request()
        .path("/experiments/exp1/data?collaborator_name=w1")
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(decode(response.body()), archive);

    let response = warp::test::request()
        .path("/experiments/missing/data?collaborator_name=w1")
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_upload_is_refused() {
    let (director, workspace, dir) = setup().await;
    let api = routes(director, workspace, IdentitySource::Header);

    for expected in &[true, false] {
        let response = warp::test::request()
            .method("POST")
            .path("/experiments")
            .body(upload("exp1", &["w1"], b"archive", 4))
            .reply(&api)
            .await;
        let submitted: SetNewExperimentResponse =
            serde_json::from_slice(response.body()).unwrap();
        assert_eq!(submitted.status, *expected);
    }
    // the archive of the refused upload is gone
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_corrupted_upload_is_rejected() {
    let (director, workspace, dir) = setup().await;
    let api = routes(director.clone(), workspace, IdentitySource::Header);
    let metadata = ExperimentMetadata {
        experiment_name: "exp1".into(),
        collaborator_names: vec!["w1".into()],
    };
    let mut body = BytesMut::new();
    body.extend_from_slice(&metadata_frame(&metadata).unwrap());
    body.extend_from_slice(&Chunk::new(&b"good"[..]).encode());
    body.extend_from_slice(
        &Chunk {
            size: 10,
            data: Bytes::from_static(b"bad"),
        }
        .encode(),
    );

    let response = warp::test::request()
        .method("POST")
        .path("/experiments")
        .body(body.freeze())
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!director.registry().contains(&"exp1".into()));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_wait_experiment_long_poll() {
    let (director, workspace, _dir) = setup().await;
    let api = routes(director.clone(), workspace, IdentitySource::Header);

    let response = warp::test::request()
        .method("POST")
        .path("/experiments")
        .body(upload("exp1", &["w1"], b"archive", 4))
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let runner = director.clone();
    let execution = tokio::spawn(async move { runner.run_next().await });

    let request = WaitExperimentRequest {
        collaborator_name: "w1".into(),
    };
    for _ in 0..2 {
        let response = warp::test::request()
            .method("POST")
            .path("/experiments/wait")
            .json(&request)
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let assigned: WaitExperimentResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(assigned.experiment_name.as_str(), "exp1");
    }

    let response = warp::test::request()
        .path("/experiments/exp1/status")
        .reply(&api)
        .await;
    let info: ExperimentInfo = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(info.status, ExperimentStatus::InProgress);

    // the active experiment cannot be removed
    let response = warp::test::request()
        .method("DELETE")
        .path("/experiments/exp1")
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    execution.abort();
}

#[tokio::test]
async fn test_remove_requires_submitter() {
    let (director, workspace, _dir) = setup().await;
    let api = routes(director.clone(), workspace, IdentitySource::Header);

    warp::test::request()
        .method("POST")
        .path("/experiments")
        .header(CLIENT_ID_HEADER, "alice")
        .body(upload("exp1", &["w1"], b"archive", 4))
        .reply(&api)
        .await;

    let response = warp::test::request()
        .method("DELETE")
        .path("/experiments/exp1")
        .header(CLIENT_ID_HEADER, "mallory")
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = warp::test::request()
        .method("DELETE")
        .path("/experiments/exp1")
        .header(CLIENT_ID_HEADER, "alice")
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!director.registry().contains(&"exp1".into()));
}
