//! The director API over HTTP.
//!
//! | route | operation |
//! |-------|-----------|
//! | `POST /envoys/connect` | [`Director::acknowledge`] |
//! | `POST /envoys/status` | [`Director::update_status`] |
//! | `GET /envoys` | [`Director::get_envoys`] |
//! | `POST /experiments/wait` | [`Director::wait_experiment`] (long poll) |
//! | `GET /experiments/{name}/data` | archive download, as frames |
//! | `POST /experiments` | archive upload, as frames, then [`Director::set_new_experiment`] |
//! | `GET /experiments` | the experiments of the caller |
//! | `GET /experiments/{name}/status` | status of an experiment |
//! | `DELETE /experiments/{name}` | [`Director::remove_experiment`] |
//! | `GET /flow/status` | [`Director::get_flow_status`] |

mod identity;
#[cfg(feature = "tls")]
mod tls;

pub use self::identity::{with_caller, IdentitySource};

use std::convert::Infallible;

use bytes::Buf;
use displaydoc::Display;
use futures::Stream;
use thiserror::Error;
use tracing::{debug, error, info};
use warp::{
    http::StatusCode,
    hyper::Body,
    reply::{self, Reply},
    Filter,
    Rejection,
};

use crate::{
    director::{Director, DirectorError},
    settings::ApiSettings,
    workspace::ArchiveWorkspace,
};
use fedflow_core::{
    api::{
        ConnectEnvoyRequest,
        ConnectEnvoyResponse,
        ExperimentDataQuery,
        RemoveExperimentResponse,
        SetNewExperimentResponse,
        UpdateEnvoyStatusRequest,
        UpdateEnvoyStatusResponse,
        WaitExperimentRequest,
        WaitExperimentResponse,
    },
    transfer::{
        archive_frames,
        read_metadata,
        save_archive,
        FrameReader,
        TransferError,
        DEFAULT_CHUNK_SIZE,
    },
    ExperimentName,
};

/// Serves the API until the server fails.
///
/// With the `tls` feature and TLS settings, connections are mutually authenticated and callers
/// are identified by their certificate. Otherwise callers are identified by a request header.
///
/// # Errors
/// Fails if the address cannot be bound or the TLS settings are invalid.
pub async fn serve(
    api_settings: ApiSettings,
    director: Director,
    workspace: ArchiveWorkspace,
) -> Result<(), RestError> {
    #[cfg(feature = "tls")]
    {
        if api_settings.tls_enabled() {
            return tls::run_https(api_settings, director, workspace).await;
        }
    }
    run_http(api_settings, director, workspace).await
}

/// All routes of the API, identifying callers with `identity`.
pub fn routes(
    director: Director,
    workspace: ArchiveWorkspace,
    identity: IdentitySource,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let connect = warp::path!("envoys" / "connect")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_director(director.clone()))
        .and_then(handle_connect);

    let update_status = warp::path!("envoys" / "status")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_director(director.clone()))
        .and_then(handle_update_status);

    let envoys = warp::path!("envoys")
        .and(warp::get())
        .and(with_director(director.clone()))
        .and_then(handle_envoys);

    let wait = warp::path!("experiments" / "wait")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_director(director.clone()))
        .and_then(handle_wait);

    let data = warp::path!("experiments" / String / "data")
        .and(warp::get())
        .and(warp::query::<ExperimentDataQuery>())
        .and(with_director(director.clone()))
        .and_then(handle_data);

    let submit = warp::path!("experiments")
        .and(warp::post())
        .and(with_caller(identity.clone()))
        .and(warp::body::stream())
        .and(with_workspace(workspace))
        .and(with_director(director.clone()))
        .and_then(handle_submit);

    let list = warp::path!("experiments")
        .and(warp::get())
        .and(with_caller(identity.clone()))
        .and(with_director(director.clone()))
        .and_then(handle_list);

    let status = warp::path!("experiments" / String / "status")
        .and(warp::get())
        .and(with_director(director.clone()))
        .and_then(handle_status);

    let remove = warp::path!("experiments" / String)
        .and(warp::delete())
        .and(with_caller(identity))
        .and(with_director(director.clone()))
        .and_then(handle_remove);

    let flow = warp::path!("flow" / "status")
        .and(warp::get())
        .and(with_director(director))
        .and_then(handle_flow_status);

    connect
        .or(update_status)
        .or(envoys)
        .or(wait)
        .or(data)
        .or(submit)
        .or(list)
        .or(status)
        .or(remove)
        .or(flow)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Handles the first contact of an envoy.
async fn handle_connect(
    request: ConnectEnvoyRequest,
    director: Director,
) -> Result<impl Reply, Infallible> {
    info!("envoy {} is attempting to connect", request.envoy_name);
    let accepted = director.acknowledge(&request.envoy_name);
    Ok(reply::json(&ConnectEnvoyResponse { accepted }))
}

/// Handles a heartbeat.
async fn handle_update_status(
    request: UpdateEnvoyStatusRequest,
    director: Director,
) -> Result<impl Reply, Rejection> {
    let period = director
        .update_status(&request.envoy_name, request.is_experiment_running)
        .map_err(ApiRejection::reject)?;
    Ok(reply::json(&UpdateEnvoyStatusResponse {
        health_check_period: period.as_secs(),
    }))
}

async fn handle_envoys(director: Director) -> Result<impl Reply, Infallible> {
    Ok(reply::json(&director.get_envoys()))
}

/// Holds the request until an experiment is assigned to the envoy.
async fn handle_wait(
    request: WaitExperimentRequest,
    director: Director,
) -> Result<impl Reply, Infallible> {
    debug!("envoy {} waits for an experiment", request.collaborator_name);
    let experiment_name = director.wait_experiment(&request.collaborator_name).await;
    debug!(
        "experiment {} is ready for envoy {}",
        experiment_name, request.collaborator_name
    );
    Ok(reply::json(&WaitExperimentResponse { experiment_name }))
}

/// Streams the archive of an experiment.
async fn handle_data(
    name: String,
    query: ExperimentDataQuery,
    director: Director,
) -> Result<impl Reply, Rejection> {
    let name = ExperimentName::from(name);
    let path = director
        .get_experiment_data(&name)
        .map_err(ApiRejection::reject)?;
    debug!(
        "envoy {} downloads the archive of experiment {}",
        query.collaborator_name, name
    );
    let frames = archive_frames(&path, DEFAULT_CHUNK_SIZE)
        .await
        .map_err(|err| warp::reject::custom(ApiRejection::Io(err)))?;
    Ok(reply::with_header(
        reply::Response::new(Body::wrap_stream(frames)),
        "Content-Type",
        "application/octet-stream",
    ))
}

/// Receives an archive and admits its experiment.
async fn handle_submit<S, B>(
    caller: String,
    body: S,
    workspace: ArchiveWorkspace,
    director: Director,
) -> Result<impl Reply, Rejection>
where
    S: Stream<Item = Result<B, warp::Error>> + Send + 'static,
    B: Buf + Send + 'static,
{
    let mut reader = FrameReader::new(Box::pin(body));
    let metadata = read_metadata(&mut reader)
        .await
        .map_err(ApiRejection::reject)?;

    let path = workspace.allocate();
    let size = save_archive(&mut reader, &path)
        .await
        .map_err(ApiRejection::reject)?;
    info!(
        "received {} bytes for experiment {} from {}",
        size, metadata.experiment_name, caller
    );

    let status = director
        .set_new_experiment(
            metadata.experiment_name,
            metadata.collaborator_names,
            path,
            Some(caller),
        )
        .await;
    Ok(reply::json(&SetNewExperimentResponse { status }))
}

async fn handle_list(caller: String, director: Director) -> Result<impl Reply, Infallible> {
    Ok(reply::json(&director.get_user_experiments(&caller)))
}

async fn handle_status(name: String, director: Director) -> Result<impl Reply, Rejection> {
    let name = ExperimentName::from(name);
    let experiment = director
        .registry()
        .get(&name)
        .ok_or(DirectorError::ExperimentNotFound(name))
        .map_err(ApiRejection::reject)?;
    Ok(reply::json(&experiment.info()))
}

async fn handle_remove(
    name: String,
    caller: String,
    director: Director,
) -> Result<impl Reply, Rejection> {
    director
        .remove_experiment(&ExperimentName::from(name), &caller)
        .await
        .map_err(ApiRejection::reject)?;
    Ok(reply::json(&RemoveExperimentResponse { removed: true }))
}

/// Holds the request until the next experiment ends.
async fn handle_flow_status(director: Director) -> Result<impl Reply, Infallible> {
    Ok(reply::json(&director.get_flow_status().await))
}

/// Converts a director handle into a `warp` filter.
fn with_director(
    director: Director,
) -> impl Filter<Extract = (Director,), Error = Infallible> + Clone {
    warp::any().map(move || director.clone())
}

/// Converts an archive workspace into a `warp` filter.
fn with_workspace(
    workspace: ArchiveWorkspace,
) -> impl Filter<Extract = (ArchiveWorkspace,), Error = Infallible> + Clone {
    warp::any().map(move || workspace.clone())
}

#[derive(Debug, Display)]
/// A failed API request.
pub enum ApiRejection {
    /// {0}
    Director(DirectorError),
    /// invalid archive transfer: {0}
    Transfer(TransferError),
    /// failed to read the archive: {0}
    Io(std::io::Error),
}

impl warp::reject::Reject for ApiRejection {}

impl From<DirectorError> for ApiRejection {
    fn from(err: DirectorError) -> Self {
        Self::Director(err)
    }
}

impl From<TransferError> for ApiRejection {
    fn from(err: TransferError) -> Self {
        Self::Transfer(err)
    }
}

impl ApiRejection {
    fn reject(err: impl Into<ApiRejection>) -> Rejection {
        warp::reject::custom(err.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Director(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            Self::Director(DirectorError::NotSubmitter(_)) => StatusCode::FORBIDDEN,
            Self::Director(_) => StatusCode::CONFLICT,
            Self::Transfer(err) if err.is_integrity_error() => StatusCode::BAD_REQUEST,
            Self::Transfer(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if let Some(rejection) = err.find::<ApiRejection>() {
        (rejection.status_code(), rejection.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, String::new())
    } else if let Some(err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, err.to_string())
    } else if let Some(err) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, err.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, String::new())
    } else {
        error!("unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, String::new())
    };
    Ok(reply::with_status(message, code))
}

#[derive(Debug, Error)]
/// Errors of the API server.
pub enum RestError {
    #[error("invalid TLS configuration: {0}")]
    InvalidTlsConfig(String),
    #[error("failed to bind the API: {0}")]
    Bind(#[from] warp::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs a plain HTTP server, identifying callers by header.
async fn run_http(
    api_settings: ApiSettings,
    director: Director,
    workspace: ArchiveWorkspace,
) -> Result<(), RestError> {
    let routes = routes(director, workspace, IdentitySource::Header);
    let (address, server) = warp::serve(routes).try_bind_ephemeral(api_settings.bind_address)?;
    info!("API listening on http://{}", address);
    server.await;
    Ok(())
}
