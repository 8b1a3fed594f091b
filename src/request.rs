use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::ReqbucketResult;
use crate::client::{HttpClient, RequestExecution};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::response::{HttpResponse, TypedResponse};
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    endpoint: Endpoint,
    query_pairs: Vec<(String, Option<String>)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    cancellation: Option<CancellationToken>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, endpoint: Endpoint) -> Self {
        Self {
            client,
            endpoint,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            total_timeout: None,
            retry_policy: None,
            cancellation: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ReqbucketResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.optional_query_pair(name, Some(value))
    }

    pub fn optional_query_pair<V>(mut self, name: impl Into<String>, value: Option<V>) -> Self
    where
        V: Into<String>,
    {
        self.query_pairs.push((name.into(), value.map(Into::into)));
        self
    }

    pub fn query<T>(mut self, params: &T) -> ReqbucketResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), Some(value.into_owned()))),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> ReqbucketResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub async fn send(self) -> ReqbucketResult<HttpResponse> {
        let execution = RequestExecution {
            endpoint: self.endpoint,
            query_pairs: self.query_pairs,
            headers: self.headers,
            body: self.body.unwrap_or_default(),
            request_timeout: self.timeout,
            total_timeout: self.total_timeout,
            retry_policy: self.retry_policy,
            cancellation: self.cancellation,
        };
        self.client.send_request(execution).await
    }

    pub async fn send_json<T>(self) -> ReqbucketResult<T>
    where
        T: DeserializeOwned,
    {
        self.send().await?.guard_success()?.json()
    }

    pub async fn send_typed<T>(self) -> ReqbucketResult<TypedResponse<T>>
    where
        T: DeserializeOwned,
    {
        Ok(TypedResponse::new(self.send().await?))
    }
}
