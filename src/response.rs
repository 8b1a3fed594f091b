use std::marker::PhantomData;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::ReqbucketResult;
use crate::error::Error;
use crate::util::truncate_body;

#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    method: Method,
    uri: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            method: Method::GET,
            uri: String::new(),
        }
    }

    pub(crate) fn with_request(mut self, method: Method, uri: String) -> Self {
        self.method = method;
        self.uri = uri;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn guard_success(self) -> ReqbucketResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::BadStatus {
            status: self.status.as_u16(),
            method: self.method,
            uri: self.uri,
            body: truncate_body(&self.body),
        })
    }

    pub fn json<T>(&self) -> ReqbucketResult<T>
    where
        T: DeserializeOwned,
    {
        if self.body.is_empty() {
            return Err(Error::EmptyBody {
                status: self.status.as_u16(),
            });
        }
        if !self.headers.contains_key(CONTENT_TYPE) {
            return Err(Error::MissingContentType {
                status: self.status.as_u16(),
            });
        }
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    pub fn decode_error<E>(&self) -> Option<ErrorBody<E>>
    where
        E: DeserializeOwned,
    {
        if self.is_success() {
            return None;
        }
        let status = self.status;
        match self.json::<E>() {
            Ok(error) => Some(ErrorBody::Provider { status, error }),
            Err(_) => Some(ErrorBody::BadStatus {
                status,
                body: truncate_body(&self.body),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorBody<E> {
    Provider { status: StatusCode, error: E },
    BadStatus { status: StatusCode, body: String },
}

impl<E> ErrorBody<E> {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Provider { status, .. } | Self::BadStatus { status, .. } => *status,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TypedResponse<T> {
    response: HttpResponse,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedResponse<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(response: HttpResponse) -> Self {
        Self {
            response,
            _marker: PhantomData,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn into_inner(self) -> HttpResponse {
        self.response
    }

    pub fn decode(self) -> ReqbucketResult<T> {
        self.response.guard_success()?.json()
    }

    pub fn decode_error<E>(&self) -> Option<ErrorBody<E>>
    where
        E: DeserializeOwned,
    {
        self.response.decode_error()
    }
}
