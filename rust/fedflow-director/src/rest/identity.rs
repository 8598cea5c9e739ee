//! Identification of API callers.

use warp::{Filter, Rejection};

use fedflow_core::api::{CLIENT_ID_HEADER, DEFAULT_CLIENT_ID};

/// Where the identity of a caller comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentitySource {
    /// The [`CLIENT_ID_HEADER`] of each request, or [`DEFAULT_CLIENT_ID`] without it.
    Header,
    /// The common name of the client certificate of the connection.
    Certificate(Option<String>),
}

impl IdentitySource {
    pub fn resolve(&self, header: Option<String>) -> String {
        let identity = match self {
            Self::Header => header,
            Self::Certificate(common_name) => common_name.clone(),
        };
        identity.unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string())
    }
}

/// Extracts the caller identity.
pub fn with_caller(
    source: IdentitySource,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>(CLIENT_ID_HEADER)
        .map(move |header: Option<String>| source.resolve(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_identity() {
        let source = IdentitySource::Header;
        assert_eq!(source.resolve(Some("alice".into())), "alice");
        assert_eq!(source.resolve(None), DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_certificate_identity_ignores_header() {
        let source = IdentitySource::Certificate(Some("envoy_one".into()));
        assert_eq!(source.resolve(Some("mallory".into())), "envoy_one");
        assert_eq!(
            IdentitySource::Certificate(None).resolve(Some("mallory".into())),
            DEFAULT_CLIENT_ID
        );
    }

    #[tokio::test]
    async fn test_with_caller_filter() {
        let filter = with_caller(IdentitySource::Header);
        let caller = warp::test::request()
            .header(CLIENT_ID_HEADER, "bob")
            .filter(&filter)
            .await
            .unwrap();
        assert_eq!(caller, "bob");

        let caller = warp::test::request().filter(&filter).await.unwrap();
        assert_eq!(caller, DEFAULT_CLIENT_ID);
    }
}
