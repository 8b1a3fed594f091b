use std::borrow::Cow;

use http::Method;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointClass {
    Api,
    Cdn,
    Other,
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Api => "api",
            Self::Cdn => "cdn",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointIdentity {
    class: EndpointClass,
    route: Cow<'static, str>,
}

impl EndpointIdentity {
    pub fn new(class: EndpointClass, route: impl Into<Cow<'static, str>>) -> Self {
        Self {
            class,
            route: route.into(),
        }
    }

    pub const fn api(route: &'static str) -> Self {
        Self {
            class: EndpointClass::Api,
            route: Cow::Borrowed(route),
        }
    }

    pub const fn cdn(route: &'static str) -> Self {
        Self {
            class: EndpointClass::Cdn,
            route: Cow::Borrowed(route),
        }
    }

    pub const fn other(route: &'static str) -> Self {
        Self {
            class: EndpointClass::Other,
            route: Cow::Borrowed(route),
        }
    }

    pub fn class(&self) -> EndpointClass {
        self.class
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

impl std::fmt::Display for EndpointIdentity {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.class, self.route)
    }
}

#[derive(Clone, Debug)]
pub struct Endpoint {
    identity: Option<EndpointIdentity>,
    method: Method,
    url: String,
    path_params: Vec<String>,
    requires_auth_header: bool,
    counts_against_global_rate_limit: bool,
    cacheable: bool,
}

impl Endpoint {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let cacheable = method == Method::GET;
        Self {
            identity: None,
            method,
            url: url.into(),
            path_params: Vec::new(),
            requires_auth_header: true,
            counts_against_global_rate_limit: true,
            cacheable,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn identity(mut self, identity: EndpointIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn path_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn requires_auth_header(mut self, requires: bool) -> Self {
        self.requires_auth_header = requires;
        self
    }

    pub fn counts_against_global_rate_limit(mut self, counts: bool) -> Self {
        self.counts_against_global_rate_limit = counts;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn identity_ref(&self) -> Option<&EndpointIdentity> {
        self.identity.as_ref()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path_params_ref(&self) -> &[String] {
        &self.path_params
    }

    pub fn needs_auth_header(&self) -> bool {
        self.requires_auth_header
    }

    pub fn is_global_exempt(&self) -> bool {
        !self.counts_against_global_rate_limit
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable && self.identity.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{Endpoint, EndpointClass, EndpointIdentity};

    #[test]
    fn identity_equality_ignores_path_parameters() {
        let first = Endpoint::get("https://discord.com/api/v10/channels/1/messages/2")
            .identity(EndpointIdentity::api("getMessage"))
            .path_params(["1", "2"]);
        let second = Endpoint::get("https://discord.com/api/v10/channels/9/messages/8")
            .identity(EndpointIdentity::api("getMessage"))
            .path_params(["9", "8"]);

        assert_eq!(first.identity_ref(), second.identity_ref());
        assert_ne!(first.path_params_ref(), second.path_params_ref());
    }

    #[test]
    fn identity_includes_class() {
        assert_ne!(
            EndpointIdentity::api("getAvatar"),
            EndpointIdentity::cdn("getAvatar")
        );
        assert_eq!(
            EndpointIdentity::new(EndpointClass::Cdn, String::from("getAvatar")),
            EndpointIdentity::cdn("getAvatar")
        );
    }

    #[test]
    fn endpoint_without_identity_is_never_cacheable() {
        let endpoint = Endpoint::get("https://discord.com/api/v10/gateway").cacheable(true);
        assert!(!endpoint.is_cacheable());
    }

    #[test]
    fn only_get_is_cacheable_by_default() {
        let get = Endpoint::get("https://x.test/a").identity(EndpointIdentity::api("a"));
        let post = Endpoint::post("https://x.test/a").identity(EndpointIdentity::api("a"));
        assert!(get.is_cacheable());
        assert!(!post.is_cacheable());
    }
}
