//! # gRPC Platform Library
//!
//! Service plumbing shared by every binary in the monorepo: one lifecycle
//! manager for all HTTP and gRPC listeners of a process, a REST gateway in
//! front of gRPC, and request correlation across both protocols.
//!
//! ## Features
//!
//! - **Lifecycle manager** ([`server`]): named HTTP, gRPC and gateway
//!   listeners started together; OS signals, fatal listener errors and
//!   explicit stops funnel into one shutdown that drains connections and runs
//!   prioritised shutdown hooks under a deadline
//! - **Gateway** ([`gateway`]): prefix-mounted REST routes backed by a lazy
//!   upstream channel, with health, CORS, compression and timeouts
//! - **Correlation** ([`correlation`]): `x-correlation-id` key/value codec and
//!   `x-request-id` handling for axum
//! - **Interceptors** ([`interceptors`]): ordered, name-keyed tonic
//!   interceptor chains with request-id and correlation propagation
//! - **Channels** ([`channel`]): tuned upstream channel creation
//!
//! ## Quick Start
//!
//! ```ignore
//! use grpc_platform::{Gateway, Server};
//! use tonic::service::Routes;
//!
//! let (_reporter, health) = tonic_health::server::health_reporter();
//! let gateway = Gateway::new()
//!     .with_server_address("127.0.0.1:50051")
//!     .with_health_check("/health")
//!     .with_endpoint_registration("/api/", api_routes);
//!
//! Server::builder()
//!     .with_grpc_server("grpc", "50051", Some(Routes::new(health)), None::<fn(Routes) -> Routes>)
//!     .with_gateway("gateway", "8081", gateway)
//!     .build()?
//!     .serve()
//!     .await?;
//! ```

pub mod channel;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod interceptors;
pub mod server;

pub use channel::{ChannelConfig, create_channel, create_channel_lazy};
pub use correlation::Correlation;
pub use error::{GrpcError, GrpcResult};
pub use gateway::{CorsConfig, Gateway, GatewayError};
pub use interceptors::{
  ChainInterceptor, InterceptorChain, default_client_chain, default_server_chain,
};
pub use server::{HttpConfig, GrpcConfig, Server, ServerBuilder, ServerError, ShutdownContext, ShutdownHook};
