//! REST front for a gRPC server.
//!
//! A [`Gateway`] collects endpoint registrations, each a function that turns
//! the upstream [`Channel`] into an axum [`Router`], and assembles them into
//! one router served as an HTTP listener by
//! [`ServerBuilder::with_gateway`](crate::server::ServerBuilder::with_gateway).
//!
//! ```ignore
//! let gateway = Gateway::new()
//!     .with_server_address("127.0.0.1:50051")
//!     .with_health_check("/health")
//!     .with_endpoint_registration("/api/", |channel| orders_routes(OrdersClient::new(channel)));
//! ```

mod cors;
mod error;

pub use cors::CorsConfig;
pub use error::GatewayError;

use axum::{
  Json, Router,
  extract::{Request, State},
  http::{HeaderMap, HeaderName, StatusCode},
  middleware::{self, Next},
  response::Response,
  routing::get,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::channel::{ChannelConfig, create_channel_lazy_with_config, upstream_uri};
use crate::correlation::correlation_layer;
use crate::headers::DEFAULT_FORWARDED_HEADERS;

pub const DEFAULT_SERVER_ADDRESS: &str = "[::1]:50051";

type EndpointFn = Box<dyn FnOnce(Channel) -> Router + Send>;
type HandlersFn = Box<dyn FnOnce(Router) -> Router + Send>;

/// Incoming HTTP headers selected for forwarding to the upstream server.
///
/// Stored as a request extension on every gateway route; handlers turn it
/// into call metadata with [`request`](Self::request).
#[derive(Debug, Clone, Default)]
pub struct ForwardedHeaders {
  headers: HeaderMap,
}

impl ForwardedHeaders {
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  pub fn metadata(&self) -> MetadataMap {
    MetadataMap::from_headers(self.headers.clone())
  }

  /// A tonic request for `message` carrying the forwarded headers as metadata.
  pub fn request<T>(&self, message: T) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = self.metadata();
    request
  }
}

async fn forward_headers(
  State(names): State<Arc<[HeaderName]>>,
  mut request: Request,
  next: Next,
) -> Response {
  let mut headers = HeaderMap::new();
  for name in names.iter() {
    for value in request.headers().get_all(name) {
      headers.append(name.clone(), value.clone());
    }
  }
  request.extensions_mut().insert(ForwardedHeaders { headers });
  next.run(request).await
}

async fn health_check(channel: Channel) -> (StatusCode, Json<Value>) {
  let mut client = HealthClient::new(channel);
  match client.check(HealthCheckRequest { service: String::new() }).await {
    Ok(response) => {
      let status = ServingStatus::try_from(response.into_inner().status).unwrap_or(ServingStatus::Unknown);
      let code = if status == ServingStatus::Serving {
        StatusCode::OK
      } else {
        StatusCode::SERVICE_UNAVAILABLE
      };
      (code, Json(json!({ "status": status.as_str_name() })))
    }
    Err(status) => {
      tracing::warn!(code = ?status.code(), message = status.message(), "upstream health check failed");
      (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": ServingStatus::NotServing.as_str_name() })),
      )
    }
  }
}

/// Builder of the gateway router.
pub struct Gateway {
  server_address: String,
  channel_config: ChannelConfig,
  endpoints: Vec<(String, EndpointFn)>,
  router: Router,
  http_handlers: Vec<HandlersFn>,
  health_path: Option<String>,
  cors: Option<CorsConfig>,
  compression: bool,
  timeout: Option<Duration>,
  forwarded_headers: Vec<HeaderName>,
}

impl Default for Gateway {
  fn default() -> Self {
    Self::new()
  }
}

impl Gateway {
  pub fn new() -> Self {
    Self {
      server_address: DEFAULT_SERVER_ADDRESS.to_string(),
      channel_config: ChannelConfig::default(),
      endpoints: Vec::new(),
      router: Router::new(),
      http_handlers: Vec::new(),
      health_path: None,
      cors: None,
      compression: false,
      timeout: None,
      forwarded_headers: DEFAULT_FORWARDED_HEADERS
        .into_iter()
        .map(HeaderName::from_static)
        .collect(),
    }
  }

  /// Address of the upstream gRPC server, with or without a scheme.
  pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
    self.server_address = address.into();
    self
  }

  pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
    self.channel_config = config;
    self
  }

  /// Routes built by `register` are served under `prefix`, which must start
  /// and end with `/`. `/` mounts them at the root; any other prefix is
  /// stripped before the routes see the path.
  pub fn with_endpoint_registration<F>(mut self, prefix: impl Into<String>, register: F) -> Self
  where
    F: FnOnce(Channel) -> Router + Send + 'static,
  {
    self.endpoints.push((prefix.into(), Box::new(register)));
    self
  }

  /// Base router the gateway routes are added to.
  pub fn with_router(mut self, router: Router) -> Self {
    self.router = router;
    self
  }

  /// Plain HTTP routes outside the gRPC mapping, mounted before the endpoints.
  pub fn with_http_handlers<F>(mut self, register: F) -> Self
  where
    F: FnOnce(Router) -> Router + Send + 'static,
  {
    self.http_handlers.push(Box::new(register));
    self
  }

  /// `GET path` reports the upstream `grpc.health.v1.Health/Check` result.
  pub fn with_health_check(mut self, path: impl Into<String>) -> Self {
    self.health_path = Some(path.into());
    self
  }

  pub fn with_cors(mut self, config: CorsConfig) -> Self {
    self.cors = Some(config);
    self
  }

  pub fn with_compression(mut self, enabled: bool) -> Self {
    self.compression = enabled;
    self
  }

  /// Requests running longer than `timeout` are answered with 408.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = (!timeout.is_zero()).then_some(timeout);
    self
  }

  /// Replaces the forwarded header list. Names that are not valid header
  /// names are skipped.
  pub fn with_headers_to_forward<I, S>(mut self, headers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self.forwarded_headers = headers
      .into_iter()
      .filter_map(|name| HeaderName::try_from(name.as_ref().to_ascii_lowercase()).ok())
      .collect();
    self
  }

  fn validate(&self) -> Result<(), GatewayError> {
    if self.endpoints.is_empty() {
      return Err(GatewayError::NoEndpointsRegistered);
    }

    let mut invalid: Vec<&str> = self
      .endpoints
      .iter()
      .map(|(prefix, _)| prefix.as_str())
      .filter(|prefix| !is_valid_prefix(prefix))
      .collect();
    invalid.sort_unstable();
    invalid.dedup();

    let mut errors: Vec<GatewayError> = invalid
      .into_iter()
      .map(|prefix| GatewayError::InvalidPrefix(prefix.to_string()))
      .collect();
    if let Some(path) = self.health_path.as_deref().filter(|path| !path.starts_with('/')) {
      errors.push(GatewayError::InvalidHealthPath(path.to_string()));
    }
    GatewayError::join(errors)
  }

  /// Assembles the router. Must be called inside a Tokio runtime.
  pub fn build(self) -> Result<Router, GatewayError> {
    self.validate()?;

    let address = upstream_uri(&self.server_address);
    let channel = create_channel_lazy_with_config(address.clone(), self.channel_config)?;

    let mut app = self.router;
    if let Some(path) = &self.health_path {
      let channel = channel.clone();
      app = app.route(path, get(move || health_check(channel.clone())));
    }
    for register in self.http_handlers {
      app = register(app);
    }

    let mut groups: BTreeMap<String, Vec<EndpointFn>> = BTreeMap::new();
    for (prefix, register) in self.endpoints {
      groups.entry(prefix).or_default().push(register);
    }

    for (prefix, registrations) in groups {
      let routes = registrations
        .into_iter()
        .fold(Router::new(), |routes, register| routes.merge(register(channel.clone())));
      if prefix == "/" {
        app = app.merge(routes);
      } else {
        app = app.nest(prefix.trim_end_matches('/'), routes);
      }
      tracing::debug!(prefix = %prefix, upstream = %address, "registered gateway endpoints");
    }

    let names: Arc<[HeaderName]> = self.forwarded_headers.into();
    app = correlation_layer(app.layer(middleware::from_fn_with_state(names, forward_headers)));

    if let Some(timeout) = self.timeout {
      app = app.layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout));
    }
    if self.compression {
      app = app.layer(CompressionLayer::new());
    }
    if let Some(cors) = &self.cors {
      app = app.layer(cors.layer());
    }

    Ok(app.layer(TraceLayer::new_for_http()))
  }
}

/// `/` mounts at the root; any other prefix needs a non-empty path between
/// its leading and trailing slashes.
fn is_valid_prefix(prefix: &str) -> bool {
  prefix == "/"
    || (prefix.starts_with('/') && prefix.ends_with('/') && !prefix.trim_end_matches('/').is_empty())
}
