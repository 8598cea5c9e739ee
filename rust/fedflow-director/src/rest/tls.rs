//! Mutually authenticated TLS for the API.
//!
//! Each connection is served with the routes bound to the common name of its client certificate.

use std::{path::Path, sync::Arc};

use hyper::server::conn::Http;
use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore,
    ServerConfig,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use x509_parser::parse_x509_certificate;

use super::{routes, IdentitySource, RestError};
use crate::{director::Director, settings::ApiSettings, workspace::ArchiveWorkspace};

/// Runs the HTTPS server.
pub(super) async fn run_https(
    api_settings: ApiSettings,
    director: Director,
    workspace: ArchiveWorkspace,
) -> Result<(), RestError> {
    let acceptor = acceptor(&api_settings).await?;
    let listener = TcpListener::bind(api_settings.bind_address).await?;
    info!("API listening on https://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!("failed to accept a connection: {}", err);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let director = director.clone();
        let workspace = workspace.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!("TLS handshake with {} failed: {}", peer, err);
                    return;
                }
            };
            let common_name = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certificates| certificates.first())
                .and_then(|certificate| common_name(certificate.as_ref()));
            debug!("{} connected as {:?}", peer, common_name);

            let service = warp::service(routes(
                director,
                workspace,
                IdentitySource::Certificate(common_name),
            ));
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                debug!("connection with {} closed: {}", peer, err);
            }
        });
    }
}

/// Builds the acceptor which requires client certificates issued by the root certificate.
async fn acceptor(api_settings: &ApiSettings) -> Result<TlsAcceptor, RestError> {
    let (root_certificate, certificate, private_key) = match (
        &api_settings.root_certificate,
        &api_settings.certificate,
        &api_settings.private_key,
    ) {
        (Some(root), Some(certificate), Some(key)) => (root, certificate, key),
        _ => {
            return Err(RestError::InvalidTlsConfig(
                "root certificate, certificate and private key are required".into(),
            ))
        }
    };

    let mut roots = RootCertStore::empty();
    for root in read_certificates(root_certificate).await? {
        roots.add(root).map_err(|err| {
            RestError::InvalidTlsConfig(format!("invalid root certificate: {}", err))
        })?;
    }
    let certificates = read_certificates(certificate).await?;
    let key = PrivateKeyDer::from_pem_slice(&tokio::fs::read(private_key).await?)
        .map_err(|err| RestError::InvalidTlsConfig(format!("invalid private key: {}", err)))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| RestError::InvalidTlsConfig(format!("client verifier: {}", err)))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certificates, key)
        .map_err(|err| RestError::InvalidTlsConfig(format!("server config: {}", err)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, RestError> {
    let pem = tokio::fs::read(path).await?;
    let certificates = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            RestError::InvalidTlsConfig(format!("invalid certificate {:?}: {}", path, err))
        })?;
    if certificates.is_empty() {
        return Err(RestError::InvalidTlsConfig(format!(
            "no certificate found in {:?}",
            path
        )));
    }
    Ok(certificates)
}

/// The first common name in the subject of a DER encoded certificate.
fn common_name(der: &[u8]) -> Option<String> {
    let (_, certificate) = parse_x509_certificate(der).ok()?;
    let common_name = certificate.subject().iter_common_name().next()?;
    common_name.as_str().ok().map(str::to_string)
}
