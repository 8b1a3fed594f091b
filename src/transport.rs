use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::TransportErrorKind;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} transport failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

/// Executes a single HTTP exchange. Retries and rate limiting stay with the
/// caller.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn execute(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        (**self).execute(request)
    }
}

#[cfg(feature = "hyper-transport")]
mod hyper_transport {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::Request;
    use http_body_util::{BodyExt, Full};
    use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;

    use super::{Transport, TransportError, TransportRequest, TransportResponse};
    use crate::error::TransportErrorKind;

    const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
    const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

    #[derive(Clone, Debug)]
    pub struct HyperTransport {
        client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    }

    impl HyperTransport {
        pub fn new() -> Self {
            Self::with_pool(DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_IDLE_PER_HOST)
        }

        pub fn with_pool(pool_idle_timeout: Duration, pool_max_idle_per_host: usize) -> Self {
            let https = HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build();
            let client = Client::builder(TokioExecutor::new())
                .pool_idle_timeout(pool_idle_timeout)
                .pool_max_idle_per_host(pool_max_idle_per_host)
                .build(https);
            Self { client }
        }
    }

    impl Default for HyperTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for HyperTransport {
        fn execute(
            &self,
            request: TransportRequest,
        ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
            Box::pin(async move {
                let mut http_request = Request::builder()
                    .method(request.method)
                    .uri(request.uri)
                    .body(Full::new(request.body))
                    .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
                *http_request.headers_mut() = request.headers;

                let response = self.client.request(http_request).await.map_err(|source| {
                    let kind = classify_transport_error(&source);
                    TransportError::new(kind, source)
                })?;
                let (parts, body) = response.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|source: hyper::Error| {
                        TransportError::new(TransportErrorKind::Read, source)
                    })?
                    .to_bytes();

                Ok(TransportResponse::new(parts.status, parts.headers, body))
            })
        }
    }

    pub(crate) fn classify_transport_error(
        error: &hyper_util::client::legacy::Error,
    ) -> TransportErrorKind {
        let text = error.to_string().to_ascii_lowercase();
        if error.is_connect() {
            if text.contains("dns")
                || text.contains("name or service not known")
                || text.contains("failed to lookup address")
            {
                return TransportErrorKind::Dns;
            }
            if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
                return TransportErrorKind::Tls;
            }
            return TransportErrorKind::Connect;
        }

        let incomplete = std::error::Error::source(error)
            .and_then(|source| source.downcast_ref::<hyper::Error>())
            .is_some_and(|source| source.is_incomplete_message() || source.is_closed());
        if incomplete
            || text.contains("read")
            || text.contains("connection reset")
            || text.contains("broken pipe")
            || text.contains("unexpected eof")
        {
            return TransportErrorKind::Read;
        }

        TransportErrorKind::Other
    }
}

#[cfg(feature = "hyper-transport")]
pub use hyper_transport::HyperTransport;
