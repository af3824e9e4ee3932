use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Status};

use crate::correlation::Correlation;
use crate::headers::X_CORRELATION_ID;

/// Parses every `x-correlation-id` metadata entry into a [`Correlation`]
/// request extension. Handlers read it with
/// `request.extensions().get::<Correlation>()`.
#[derive(Clone, Debug, Default)]
pub struct CorrelationServerInterceptor;

impl CorrelationServerInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl tonic::service::Interceptor for CorrelationServerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get_all(X_CORRELATION_ID)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");

        let correlation = Correlation::parse(&header);
        if !correlation.is_empty() {
            tracing::trace!(target: "grpc_platform", correlation = %correlation, "correlated gRPC request");
        }
        request.extensions_mut().insert(correlation);
        Ok(request)
    }
}

/// Sends a fixed [`Correlation`] with every outgoing call. An empty
/// correlation adds nothing.
#[derive(Clone, Debug, Default)]
pub struct CorrelationClientInterceptor {
    header: Option<String>,
}

impl CorrelationClientInterceptor {
    pub fn new(correlation: &Correlation) -> Self {
        let header = correlation.generate();
        Self {
            header: (!header.is_empty()).then_some(header),
        }
    }
}

impl tonic::service::Interceptor for CorrelationClientInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(header) = &self.header {
            let value: MetadataValue<Ascii> = header
                .parse()
                .map_err(|_| Status::internal("Failed to encode correlation header"))?;
            request.metadata_mut().append(X_CORRELATION_ID, value);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::service::Interceptor;

    #[test]
    fn test_server_parses_all_entries() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .append(X_CORRELATION_ID, "tenancy=acme".parse().unwrap());
        request
            .metadata_mut()
            .append(X_CORRELATION_ID, "correlation_id=9,tenancy=other".parse().unwrap());

        let request = CorrelationServerInterceptor::new().call(request).unwrap();
        let correlation = request.extensions().get::<Correlation>().unwrap();
        assert_eq!(correlation.tenancy(), Some("acme"));
        assert_eq!(correlation.id(), Some("9"));
    }

    #[test]
    fn test_server_without_header_stores_empty_correlation() {
        let request = CorrelationServerInterceptor::new()
            .call(Request::new(()))
            .unwrap();
        assert!(request.extensions().get::<Correlation>().unwrap().is_empty());
    }

    #[test]
    fn test_client_round_trips_through_server() {
        let correlation: Correlation = [("tenancy", "acme"), ("user", "jane doe")].into_iter().collect();
        let request = CorrelationClientInterceptor::new(&correlation)
            .call(Request::new(()))
            .unwrap();
        assert_eq!(
            request.metadata().get(X_CORRELATION_ID).unwrap(),
            "tenancy=acme,user=jane%20doe"
        );

        let request = CorrelationServerInterceptor::new().call(request).unwrap();
        assert_eq!(request.extensions().get::<Correlation>(), Some(&correlation));
    }

    #[test]
    fn test_client_with_empty_correlation_adds_nothing() {
        let request = CorrelationClientInterceptor::new(&Correlation::new())
            .call(Request::new(()))
            .unwrap();
        assert!(request.metadata().get(X_CORRELATION_ID).is_none());
    }
}
