use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};

const WILDCARD: &str = "*";

/// Cross-origin policy of the gateway.
///
/// The default accepts any origin and header, the usual REST methods, and
/// credentials. With credentials on, a `*` is answered by echoing the
/// request's origin and headers, since browsers reject a literal `*` there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<Method>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![WILDCARD.to_string()],
            allowed_methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
                Method::HEAD,
                Method::PATCH,
            ],
            allowed_headers: vec![WILDCARD.to_string()],
            allow_credentials: true,
        }
    }
}

impl CorsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.allowed_methods = methods.into_iter().collect();
        self
    }

    pub fn with_allowed_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Entries that are not valid header values are skipped with a warning.
    pub(crate) fn layer(&self) -> CorsLayer {
        let origins = if self.allowed_origins.iter().any(|o| o == WILDCARD) {
            if self.allow_credentials {
                AllowOrigin::mirror_request()
            } else {
                AllowOrigin::from(Any)
            }
        } else {
            AllowOrigin::list(self.allowed_origins.iter().filter_map(|origin| {
                HeaderValue::from_str(origin)
                    .inspect_err(|_| tracing::warn!(origin = %origin, "ignoring invalid CORS origin"))
                    .ok()
            }))
        };

        let headers = if self.allowed_headers.iter().any(|h| h == WILDCARD) {
            if self.allow_credentials {
                AllowHeaders::mirror_request()
            } else {
                AllowHeaders::from(Any)
            }
        } else {
            AllowHeaders::list(self.allowed_headers.iter().filter_map(|header| {
                HeaderName::try_from(header.as_str())
                    .inspect_err(|_| tracing::warn!(header = %header, "ignoring invalid CORS header"))
                    .ok()
            }))
        };

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(AllowMethods::list(self.allowed_methods.iter().cloned()))
            .allow_headers(headers)
            .allow_credentials(self.allow_credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CorsConfig::default();
        assert_eq!(config.allowed_origins, ["*"]);
        assert_eq!(config.allowed_headers, ["*"]);
        assert_eq!(config.allowed_methods.len(), 7);
        assert!(config.allowed_methods.contains(&Method::PATCH));
        assert!(config.allow_credentials);
    }

    #[test]
    fn test_builders() {
        let config = CorsConfig::new()
            .with_allowed_origins(["https://app.example.com"])
            .with_allowed_methods([Method::GET])
            .with_allowed_headers(["content-type"])
            .with_allow_credentials(false);
        assert_eq!(config.allowed_origins, ["https://app.example.com"]);
        assert_eq!(config.allowed_methods, [Method::GET]);
        assert_eq!(config.allowed_headers, ["content-type"]);
        assert!(!config.allow_credentials);
    }
}
