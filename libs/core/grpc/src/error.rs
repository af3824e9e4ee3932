use thiserror::Error;

pub type GrpcResult<T> = Result<T, GrpcError>;

/// Errors raised while creating an upstream channel.
#[derive(Error, Debug)]
pub enum GrpcError {
  /// Invalid URI provided for connection
  #[error("Invalid URI: {0}")]
  InvalidUri(#[source] tonic::transport::Error),

  /// Failed to establish connection
  #[error("Connection failed: {0}")]
  ConnectionFailed(#[source] tonic::transport::Error),
}

impl From<GrpcError> for tonic::Status {
  fn from(err: GrpcError) -> Self {
    match err {
      GrpcError::InvalidUri(_) => tonic::Status::invalid_argument(err.to_string()),
      GrpcError::ConnectionFailed(_) => tonic::Status::unavailable(err.to_string()),
    }
  }
}
