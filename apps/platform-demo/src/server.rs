//! Listener wiring and lifecycle of the demo service.

use axum::{Extension, Json, Router, routing::get};
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use grpc_platform::channel::ChannelConfig;
use grpc_platform::correlation::{Correlation, RequestId, correlation_layer};
use grpc_platform::gateway::{CorsConfig, ForwardedHeaders, Gateway};
use grpc_platform::interceptors::default_server_chain;
use grpc_platform::server::{BoxError, Server, ServerSettings, ShutdownHook};
use serde_json::{Value, json};
use std::time::Duration;
use tonic::service::Routes;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};
use tonic_health::server::health_reporter;
use tracing::info;

/// Plain HTTP routes; correlation data is echoed back for inspection.
fn web_router() -> Router {
    let routes = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route(
            "/whoami",
            get(
                |Extension(id): Extension<RequestId>, Extension(correlation): Extension<Correlation>| async move {
                    Json(json!({
                        "request_id": id.as_str(),
                        "correlation": correlation.into_map(),
                    }))
                },
            ),
        );
    correlation_layer(routes)
}

/// `GET /api/health/{service}` mapped onto `grpc.health.v1.Health/Check`.
fn health_endpoints(channel: Channel) -> Router {
    Router::new().route(
        "/health/{service}",
        get(
            move |axum::extract::Path(service): axum::extract::Path<String>,
                  Extension(forwarded): Extension<ForwardedHeaders>| {
                let mut client = HealthClient::new(channel.clone());
                async move {
                    let request = forwarded.request(HealthCheckRequest { service });
                    let body: Value = match client.check(request).await {
                        Ok(response) => json!({ "status": response.into_inner().status }),
                        Err(status) => json!({ "error": status.message() }),
                    };
                    Json(body)
                }
            },
        ),
    )
}

/// Starts every listener and blocks until the process is asked to stop.
///
/// # Errors
///
/// Returns an error if configuration cannot be read, a listener cannot bind
/// or shutdown does not finish cleanly.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let settings = ServerSettings::from_env().wrap_err("Failed to load lifecycle settings")?;
    let upstream = ChannelConfig::from_env().wrap_err("Failed to load upstream channel configuration")?;

    let (health_reporter, health_service) = health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;
    let health = InterceptedService::new(health_service, default_server_chain().commit());

    let gateway = Gateway::new()
        .with_server_address(format!("127.0.0.1:{}", config.grpc_port))
        .with_channel_config(upstream)
        .with_health_check("/health")
        .with_cors(CorsConfig::default())
        .with_compression(true)
        .with_timeout(Duration::from_secs(30))
        .with_endpoint_registration("/api/", health_endpoints);

    let reporter = health_reporter.clone();
    let server = Server::builder()
        .with_logger(tracing::info_span!("platform-demo"))
        .with_settings(settings)
        .with_http_server("web", &config.http_address(), web_router())
        .with_grpc_server(
            "grpc",
            &config.grpc_address(),
            None,
            Some(move |routes: Routes| routes.add_service(health)),
        )
        .with_gateway("gateway", &config.gateway_address(), gateway)
        .with_shutdown_hook(ShutdownHook::new(
            "health",
            0,
            Duration::from_secs(2),
            move |_ctx| {
                let reporter = reporter.clone();
                async move {
                    reporter
                        .set_service_status("", tonic_health::ServingStatus::NotServing)
                        .await;
                    Ok::<(), BoxError>(())
                }
            },
        ))
        .build()
        .wrap_err("Invalid server configuration")?;

    info!(
        http = %config.http_address(),
        grpc = %config.grpc_address(),
        gateway = %config.gateway_address(),
        "Starting platform demo"
    );

    server.serve().await.wrap_err("Server stopped with errors")?;
    info!("Platform demo stopped");
    Ok(())
}
