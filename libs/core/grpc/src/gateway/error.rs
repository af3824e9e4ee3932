use std::sync::Arc;
use thiserror::Error;

use crate::error::GrpcError;

/// Reasons [`Gateway::build`](super::Gateway::build) can refuse a configuration.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
  #[error("no endpoints registered")]
  NoEndpointsRegistered,

  #[error("invalid prefix {0}: must start and end with '/'")]
  InvalidPrefix(String),

  #[error("invalid health check path {0}: must start with '/'")]
  InvalidHealthPath(String),

  #[error("upstream channel: {0}")]
  Channel(Arc<GrpcError>),

  #[error("{}", display_joined(.0))]
  Multiple(Vec<GatewayError>),
}

fn display_joined(errors: &[GatewayError]) -> String {
  errors
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("\n")
}

impl From<GrpcError> for GatewayError {
  fn from(err: GrpcError) -> Self {
    GatewayError::Channel(Arc::new(err))
  }
}

impl GatewayError {
  /// One error as itself, several as [`GatewayError::Multiple`].
  pub(crate) fn join(mut errors: Vec<GatewayError>) -> Result<(), GatewayError> {
    match errors.len() {
      0 => Ok(()),
      1 => Err(errors.remove(0)),
      _ => Err(GatewayError::Multiple(errors)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_join() {
    assert!(GatewayError::join(Vec::new()).is_ok());

    let single = GatewayError::join(vec![GatewayError::InvalidPrefix("api".into())]).unwrap_err();
    assert_eq!(single.to_string(), "invalid prefix api: must start and end with '/'");

    let many = GatewayError::join(vec![
      GatewayError::InvalidPrefix("a".into()),
      GatewayError::InvalidPrefix("b".into()),
    ])
    .unwrap_err();
    assert_eq!(
      many.to_string(),
      "invalid prefix a: must start and end with '/'\ninvalid prefix b: must start and end with '/'"
    );
  }
}
