//! Upstream gRPC channels.
//!
//! The gateway talks to its gRPC server through a lazy channel, so the
//! gateway can be built before the server is listening.

pub mod config;

pub use config::ChannelConfig;

use crate::error::{GrpcError, GrpcResult};
use tonic::transport::{Channel, Endpoint};

/// `[::1]:50051` and `localhost:50051` become `http://…`; addresses that
/// already carry a scheme are kept.
pub fn upstream_uri(address: &str) -> String {
  if address.contains("://") {
    address.to_string()
  } else {
    format!("http://{address}")
  }
}

fn endpoint(addr: String, config: ChannelConfig) -> GrpcResult<Endpoint> {
  let endpoint = Endpoint::from_shared(addr.clone()).map_err(|e| {
    tracing::error!(target: "grpc_platform", addr = %addr, error = ?e, "Invalid URI");
    GrpcError::InvalidUri(e)
  })?;
  Ok(config.apply_to_endpoint(endpoint))
}

/// Connects eagerly with the default [`ChannelConfig`].
///
/// ## Example
/// ```ignore
/// use grpc_platform::channel::create_channel;
/// use tonic_health::pb::health_client::HealthClient;
///
/// let channel = create_channel("http://[::1]:50051").await?;
/// let client = HealthClient::new(channel);
/// ```
pub async fn create_channel(addr: impl Into<String>) -> GrpcResult<Channel> {
  create_channel_with_config(addr, ChannelConfig::default()).await
}

/// Returns immediately; the connection is made on the first call.
pub fn create_channel_lazy(addr: impl Into<String>) -> GrpcResult<Channel> {
  create_channel_lazy_with_config(addr, ChannelConfig::default())
}

/// Lazy channel with custom configuration. Must be called inside a Tokio
/// runtime.
pub fn create_channel_lazy_with_config(
  addr: impl Into<String>,
  config: ChannelConfig,
) -> GrpcResult<Channel> {
  let addr = addr.into();
  let endpoint = endpoint(addr.clone(), config)?;

  tracing::debug!(
    target: "grpc_platform",
    addr = %addr,
    "Creating lazy gRPC channel (connects on first request)"
  );

  Ok(endpoint.connect_lazy())
}

pub async fn create_channel_with_config(
  addr: impl Into<String>,
  config: ChannelConfig,
) -> GrpcResult<Channel> {
  let addr = addr.into();
  let endpoint = endpoint(addr.clone(), config)?;

  tracing::debug!(target: "grpc_platform", addr = %addr, "Creating gRPC channel");

  endpoint.connect().await.map_err(|e| {
    tracing::error!(
      target: "grpc_platform",
      addr = %addr,
      error = ?e,
      "Failed to connect to gRPC service"
    );
    GrpcError::ConnectionFailed(e)
  })
}
