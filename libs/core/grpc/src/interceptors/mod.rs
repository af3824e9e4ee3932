/// Re-export tonic's Interceptor trait for convenience
pub use tonic::service::Interceptor;

pub mod chain;
pub mod correlation;
pub mod request_id;

pub use chain::{ChainInterceptor, DynInterceptor, InterceptorChain, interceptor};
pub use correlation::{CorrelationClientInterceptor, CorrelationServerInterceptor};
pub use request_id::RequestIdInterceptor;

use crate::correlation::Correlation;

/// `request-id -> correlation`, for services behind the lifecycle manager.
///
/// ```ignore
/// let chain = default_server_chain().commit();
/// let health = HealthServer::with_interceptor(service, chain);
/// ```
pub fn default_server_chain() -> InterceptorChain<DynInterceptor> {
    let mut chain = InterceptorChain::new();
    chain.push("request-id", interceptor(RequestIdInterceptor::server()));
    chain.push("correlation", interceptor(CorrelationServerInterceptor::new()));
    chain
}

/// `request-id -> correlation`, propagating `correlation` on every call.
pub fn default_client_chain(correlation: &Correlation) -> InterceptorChain<DynInterceptor> {
    let mut chain = InterceptorChain::new();
    chain.push("request-id", interceptor(RequestIdInterceptor::client()));
    chain.push(
        "correlation",
        interceptor(CorrelationClientInterceptor::new(correlation)),
    );
    chain
}
