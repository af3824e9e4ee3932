use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Status};

use crate::correlation::RequestId;
use crate::headers::X_REQUEST_ID;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

/// Request id propagation (`x-request-id`).
///
/// On the server side an incoming id is kept (one is generated when the
/// caller sent none) and exposed as a [`RequestId`] extension. On the client
/// side every outgoing call gets a fresh id.
///
/// # Example
/// ```ignore
/// use grpc_platform::interceptors::RequestIdInterceptor;
/// use tonic_health::pb::health_client::HealthClient;
///
/// let client = HealthClient::with_interceptor(channel, RequestIdInterceptor::client());
/// ```
#[derive(Clone, Debug)]
pub struct RequestIdInterceptor {
    side: Side,
}

impl RequestIdInterceptor {
    pub fn server() -> Self {
        Self { side: Side::Server }
    }

    pub fn client() -> Self {
        Self { side: Side::Client }
    }
}

fn incoming_id(request: &Request<()>) -> Option<String> {
    request
        .metadata()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

impl tonic::service::Interceptor for RequestIdInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let request_id = match self.side {
            Side::Server => incoming_id(&request),
            Side::Client => None,
        }
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let value: MetadataValue<Ascii> = request_id
            .parse()
            .map_err(|_| Status::internal("Failed to create request ID"))?;
        request.metadata_mut().insert(X_REQUEST_ID, value);

        match self.side {
            Side::Server => {
                tracing::debug!(
                    target: "grpc_platform",
                    request_id = %request_id,
                    "Incoming gRPC request"
                );
                request.extensions_mut().insert(RequestId(request_id));
            }
            Side::Client => {
                tracing::debug!(
                    target: "grpc_platform",
                    request_id = %request_id,
                    "Outgoing gRPC request"
                );
            }
        }

        Ok(request)
    }
}
