use http::Method;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitReason {
    /// Too many 401/403/429 responses in the current minute.
    InvalidRequestLockout,
    /// The per-second global ceiling is used up.
    GlobalLimit,
    /// The endpoint bucket is exhausted and the retry policy refused to wait.
    BucketExhausted,
}

impl std::fmt::Display for RateLimitReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::InvalidRequestLockout => "invalid_request_lockout",
            Self::GlobalLimit => "global_limit",
            Self::BucketExhausted => "bucket_exhausted",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    Token,
    Deadline,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Token => "cancellation token",
            Self::Deadline => "total deadline",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    RateLimited,
    BadStatus,
    EmptyBody,
    MissingContentType,
    Deserialize,
    Serialize,
    SerializeQuery,
    Cancelled,
    Transport,
    Timeout,
    Configuration,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::BadStatus => "bad_status",
            Self::EmptyBody => "empty_body",
            Self::MissingContentType => "missing_content_type",
            Self::Deserialize => "deserialize",
            Self::Serialize => "serialize",
            Self::SerializeQuery => "serialize_query",
            Self::Cancelled => "cancelled",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("rate limited ({reason}) for {method} {uri}")]
    RateLimited {
        reason: RateLimitReason,
        method: Method,
        uri: String,
    },
    #[error("bad status {status} for {method} {uri}: {body}")]
    BadStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("response body is empty (status {status})")]
    EmptyBody { status: u16 },
    #[error("response has no content-type header (status {status})")]
    MissingContentType { status: u16 },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("request cancelled by {reason} for {method} {uri}")]
    Cancelled {
        reason: CancelReason,
        method: Method,
        uri: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("invalid client configuration: {message}")]
    Configuration { message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::BadStatus { .. } => ErrorCode::BadStatus,
            Self::EmptyBody { .. } => ErrorCode::EmptyBody,
            Self::MissingContentType { .. } => ErrorCode::MissingContentType,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
