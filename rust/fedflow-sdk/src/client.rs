//! The HTTP(S) client.

#[cfg(feature = "tls")]
use std::fs;
use std::{path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::stream;
#[cfg(feature = "tls")]
use reqwest::{Certificate, Identity};
use reqwest::{ClientBuilder, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

use fedflow_core::{
    api::{
        ConnectEnvoyRequest,
        ConnectEnvoyResponse,
        EnvoyInfo,
        ExperimentInfo,
        ExperimentMetadata,
        FlowStatus,
        RemoveExperimentResponse,
        SetNewExperimentResponse,
        UpdateEnvoyStatusRequest,
        UpdateEnvoyStatusResponse,
        WaitExperimentRequest,
        WaitExperimentResponse,
        CLIENT_ID_HEADER,
    },
    transfer::{
        metadata_frame,
        save_archive,
        Chunker,
        FrameReader,
        TransferError,
        DEFAULT_CHUNK_SIZE,
    },
    EnvoyName,
    ExperimentName,
};

#[derive(Debug, Clone)]
/// A client that communicates with the director's API via HTTP(S).
pub struct Client {
    /// HTTP client
    client: reqwest::Client,
    /// Director URL
    address: Arc<Url>,
    /// Identity sent to a director without TLS client authentication
    client_id: Option<Arc<String>>,
}

impl Client {
    /// Creates a new HTTP client.
    ///
    /// # Errors
    /// Fails if `address` is not a valid URL.
    pub fn new(address: &str) -> Result<Self, ClientError> {
        let client = ClientBuilder::new().build()?;
        Self::with_client(client, address)
    }

    #[cfg(feature = "tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
    /// Creates a new HTTPS client which trusts only `certificates` and authenticates with
    /// `identity`.
    ///
    /// # Errors
    /// Fails if no certificate is given or `address` is not a valid URL.
    pub fn with_tls(
        address: &str,
        certificates: Vec<Certificate>,
        identity: Identity,
    ) -> Result<Self, ClientError> {
        if certificates.is_empty() {
            return Err(ClientError::NoCertificate);
        }
        let mut builder = ClientBuilder::new()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .identity(identity);
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }
        Self::with_client(builder.build()?, address)
    }

    fn with_client(client: reqwest::Client, address: &str) -> Result<Self, ClientError> {
        let url = Url::parse(address)?;
        if url.cannot_be_a_base() {
            return Err(ClientError::InvalidAddress(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }
        Ok(Self {
            client,
            address: Arc::new(url),
            client_id: None,
        })
    }

    /// Sets the identity sent in the `client_id` header.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(Arc::new(client_id.into()));
        self
    }

    #[cfg(feature = "tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
    /// Reads DER and PEM certificates from given paths.
    pub fn certificates_from(paths: &[&Path]) -> Result<Vec<Certificate>, ClientError> {
        fn load_certificate(path: &Path) -> Result<Certificate, ClientError> {
            let encoding = fs::read(path)?;
            match path.extension().and_then(|extension| extension.to_str()) {
                Some("der") => Ok(Certificate::from_der(&encoding)?),
                Some("pem") | Some("crt") => Ok(Certificate::from_pem(&encoding)?),
                _ => Err(ClientError::UnexpectedCertificate),
            }
        }

        if paths.is_empty() {
            Err(ClientError::NoCertificate)
        } else {
            paths.iter().map(|path| load_certificate(path)).collect()
        }
    }

    #[cfg(feature = "tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
    /// Reads the PEM encoded client certificate and private key.
    pub fn identity_from(certificate: &Path, private_key: &Path) -> Result<Identity, ClientError> {
        let mut pem = fs::read(certificate)?;
        pem.push(b'\n');
        pem.extend(fs::read(private_key)?);
        Ok(Identity::from_pem(&pem)?)
    }

    /// The URL of the route made of `segments`, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = Url::clone(&self.address);
        // a base URL always has path segments
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let request = self.client.request(method, self.url(segments));
        match &self.client_id {
            Some(client_id) => request.header(CLIENT_ID_HEADER, client_id.as_str()),
            None => request,
        }
    }

    /// Registers an envoy. Returns whether the director accepted it.
    pub async fn connect_envoy(&self, envoy: &EnvoyName) -> Result<bool, ClientError> {
        let resp = self
            .request(Method::POST, &["envoys", "connect"])
            .json(&ConnectEnvoyRequest {
                envoy_name: envoy.clone(),
            })
            .send()
            .await?;
        let response: ConnectEnvoyResponse = parse(resp).await?;
        Ok(response.accepted)
    }

    /// Sends a heartbeat. Returns the period until the next one is due.
    ///
    /// # Errors
    /// Fails with [`ClientError::EnvoyNotFound`] if the director does not know the envoy.
    pub async fn update_status(
        &self,
        envoy: &EnvoyName,
        is_experiment_running: bool,
    ) -> Result<Duration, ClientError> {
        let resp = self
            .request(Method::POST, &["envoys", "status"])
            .json(&UpdateEnvoyStatusRequest {
                envoy_name: envoy.clone(),
                is_experiment_running,
            })
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::EnvoyNotFound(envoy.clone()));
        }
        let response: UpdateEnvoyStatusResponse = parse(resp).await?;
        Ok(Duration::from_secs(response.health_check_period))
    }

    pub async fn get_envoys(&self) -> Result<Vec<EnvoyInfo>, ClientError> {
        parse(self.request(Method::GET, &["envoys"]).send().await?).await
    }

    /// Waits until an experiment is assigned to the envoy.
    pub async fn wait_experiment(&self, envoy: &EnvoyName) -> Result<ExperimentName, ClientError> {
        let resp = self
            .request(Method::POST, &["experiments", "wait"])
            .json(&WaitExperimentRequest {
                collaborator_name: envoy.clone(),
            })
            .send()
            .await?;
        let response: WaitExperimentResponse = parse(resp).await?;
        Ok(response.experiment_name)
    }

    /// Downloads the archive of an experiment into a new file at `path`. Returns the number of
    /// bytes written.
    ///
    /// # Errors
    /// Fails with [`ClientError::ExperimentNotFound`] for an unknown experiment and with
    /// [`ClientError::Transfer`] if the archive arrives corrupted, in which case no file is
    /// left behind.
    pub async fn get_experiment_data(
        &self,
        name: &ExperimentName,
        envoy: &EnvoyName,
        path: impl AsRef<Path>,
    ) -> Result<u64, ClientError> {
        let resp = self
            .request(Method::GET, &["experiments", name.as_str(), "data"])
            .query(&[("collaborator_name", envoy.as_str())])
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let mut reader = FrameReader::new(Box::pin(resp.bytes_stream()));
                let size = save_archive(&mut reader, path).await?;
                debug!("downloaded {} bytes of experiment {}", size, name);
                Ok(size)
            }
            StatusCode::NOT_FOUND => Err(ClientError::ExperimentNotFound(name.clone())),
            _ => Err(unexpected(resp).await),
        }
    }

    /// Uploads an experiment archive. Returns whether the director queued the experiment.
    pub async fn set_new_experiment(
        &self,
        name: ExperimentName,
        collaborators: Vec<EnvoyName>,
        archive: impl AsRef<Path>,
    ) -> Result<bool, ClientError> {
        let archive = tokio::fs::read(archive).await?;
        let metadata = ExperimentMetadata {
            experiment_name: name,
            collaborator_names: collaborators,
        };
        let mut frames = vec![metadata_frame(&metadata)?];
        frames.extend(Chunker::new(&archive, DEFAULT_CHUNK_SIZE).frames());
        debug!(
            "uploading experiment {} in {} frames",
            metadata.experiment_name,
            frames.len()
        );

        let body = stream::iter(frames.into_iter().map(Ok::<Bytes, std::io::Error>));
        let resp = self
            .request(Method::POST, &["experiments"])
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        let response: SetNewExperimentResponse = parse(resp).await?;
        Ok(response.status)
    }

    /// Experiments submitted by this client.
    pub async fn list_experiments(&self) -> Result<Vec<ExperimentInfo>, ClientError> {
        parse(self.request(Method::GET, &["experiments"]).send().await?).await
    }

    /// The state of an experiment, if the director knows it.
    pub async fn get_experiment_status(
        &self,
        name: &ExperimentName,
    ) -> Result<Option<ExperimentInfo>, ClientError> {
        let resp = self
            .request(Method::GET, &["experiments", name.as_str(), "status"])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(resp).await.map(Some)
    }

    /// Removes an experiment submitted by this client.
    pub async fn remove_experiment(&self, name: &ExperimentName) -> Result<bool, ClientError> {
        let resp = self
            .request(Method::DELETE, &["experiments", name.as_str()])
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ClientError::ExperimentNotFound(name.clone())),
            _ => parse::<RemoveExperimentResponse>(resp)
                .await
                .map(|response| response.removed),
        }
    }

    /// Waits for the next experiment to end.
    pub async fn get_flow_status(&self) -> Result<FlowStatus, ClientError> {
        parse(self.request(Method::GET, &["flow", "status"]).send().await?).await
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    if resp.status() == StatusCode::OK {
        Ok(resp.json().await?)
    } else {
        Err(unexpected(resp).await)
    }
}

async fn unexpected(resp: Response) -> ClientError {
    let status = resp.status();
    let message = resp.text().await.unwrap_or_default();
    ClientError::UnexpectedResponse(status, message)
}

/// Error returned by a [`Client`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("envoy {0} is not connected")]
    EnvoyNotFound(EnvoyName),

    #[error("experiment {0} does not exist")]
    ExperimentNotFound(ExperimentName),

    #[error("archive transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response from the director: {0} {1}")]
    UnexpectedResponse(StatusCode, String),

    #[error("Invalid director address: {0}")]
    InvalidAddress(#[from] url::ParseError),

    #[error("Reading from file failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected certificate extension")]
    UnexpectedCertificate,

    #[error("No certificate found")]
    NoCertificate,
}

impl ClientError {
    /// Checks whether the error reports an unknown envoy.
    pub fn is_envoy_not_found(&self) -> bool {
        matches!(self, Self::EnvoyNotFound(_))
    }
}
