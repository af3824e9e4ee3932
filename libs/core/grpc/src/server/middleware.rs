//! Tower layers wrapped around every listener's router.
//!
//! gRPC listeners get a server-side deadline, panic recovery and a trace span
//! per call, nested inside the correlation span that carries the request id.
//! Failures are answered with a gRPC status (`DEADLINE_EXCEEDED`, `INTERNAL`)
//! rather than an HTTP error page so clients see a proper trailer.

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
};
use std::any::Any;
use std::time::Duration;
use tonic::Status;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, warn};

use super::config::{GrpcServerOptions, HttpConfig};
use crate::correlation::correlation_layer;

const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Read and write limits of an HTTP listener.
pub(crate) fn http_app(handler: Router, config: &HttpConfig) -> Router {
    handler
        .layer(RequestBodyTimeoutLayer::new(config.read_timeout))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.write_timeout,
        ))
}

/// Deadline, panic recovery and tracing for a gRPC listener.
pub(crate) fn grpc_app(routes: Router, options: &GrpcServerOptions) -> Router {
    let mut app = routes;
    if let Some(timeout) = options.request_timeout {
        app = app.layer(middleware::from_fn_with_state(timeout, enforce_deadline));
    }
    if options.panic_recovery {
        app = app.layer(CatchPanicLayer::custom(panic_response));
    }
    let app = app.layer(
        TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );
    correlation_layer(app)
}

/// Bounds a call by the server limit or the client's `grpc-timeout`, whichever is shorter.
async fn enforce_deadline(State(limit): State<Duration>, request: Request, next: Next) -> Response {
    let limit = request
        .headers()
        .get(GRPC_TIMEOUT)
        .and_then(parse_grpc_timeout)
        .map_or(limit, |client| client.min(limit));

    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(timeout = ?limit, "gRPC call exceeded its deadline");
            Status::deadline_exceeded("request deadline exceeded").into_http()
        }
    }
}

/// Parses a `grpc-timeout` value: at most eight digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
fn parse_grpc_timeout(value: &HeaderValue) -> Option<Duration> {
    let value = value.to_str().ok()?;
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        'H' => Some(Duration::from_secs(amount * 3600)),
        'M' => Some(Duration::from_secs(amount * 60)),
        'S' => Some(Duration::from_secs(amount)),
        'm' => Some(Duration::from_millis(amount)),
        'u' => Some(Duration::from_micros(amount)),
        'n' => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %message, "gRPC handler panicked");
    Status::internal("internal server error").into_http()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use tokio::time::sleep;
    use tower::ServiceExt;

    fn options() -> GrpcServerOptions {
        GrpcServerOptions::default().with_request_timeout(Duration::from_millis(100))
    }

    fn grpc_request(path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/grpc")
            .body(Body::empty())
            .unwrap()
    }

    fn grpc_status(response: &Response) -> Option<&str> {
        response.headers().get("grpc-status").and_then(|v| v.to_str().ok())
    }

    fn routes() -> Router {
        Router::new()
            .route("/svc/Fast", post(|| async { "ok" }))
            .route(
                "/svc/Slow",
                post(|| async {
                    sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .route("/svc/Panic", post(panicking_handler))
    }

    async fn panicking_handler() -> &'static str {
        panic!("handler bug")
    }

    #[test]
    fn test_parse_grpc_timeout() {
        let parse = |v: &'static str| parse_grpc_timeout(&HeaderValue::from_static(v));
        assert_eq!(parse("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse("99999999n"), Some(Duration::from_nanos(99_999_999)));
        assert_eq!(parse("123456789S"), None);
        assert_eq!(parse("S"), None);
        assert_eq!(parse("10x"), None);
        assert_eq!(parse("+5S"), None);
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let app = grpc_app(routes(), &options());
        let response = app.oneshot(grpc_request("/svc/Fast")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(grpc_status(&response).is_none());
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_slow_call_gets_deadline_exceeded() {
        let app = grpc_app(routes(), &options());
        let started = std::time::Instant::now();
        let response = app.oneshot(grpc_request("/svc/Slow")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(grpc_status(&response), Some("4"));
    }

    #[tokio::test]
    async fn test_client_deadline_wins_when_shorter() {
        let options = GrpcServerOptions::default().with_request_timeout(Duration::from_secs(30));
        let app = grpc_app(routes(), &options);
        let mut request = grpc_request("/svc/Slow");
        request
            .headers_mut()
            .insert(GRPC_TIMEOUT, HeaderValue::from_static("50m"));

        let started = std::time::Instant::now();
        let response = app.oneshot(request).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(grpc_status(&response), Some("4"));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_status() {
        let app = grpc_app(routes(), &options());
        let response = app.oneshot(grpc_request("/svc/Panic")).await.unwrap();
        assert_eq!(grpc_status(&response), Some("13"));
    }

    #[tokio::test]
    async fn test_layers_can_be_disabled() {
        let options = GrpcServerOptions::default()
            .with_request_timeout(Duration::ZERO)
            .with_panic_recovery(false);
        assert!(options.request_timeout.is_none());

        let app = grpc_app(routes(), &options);
        let response = app.oneshot(grpc_request("/svc/Fast")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
