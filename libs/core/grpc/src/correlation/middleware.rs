use axum::{
  Router,
  extract::Request,
  http::HeaderValue,
  middleware::{self, Next},
  response::Response,
};

use tracing::{Instrument, info_span};

use super::Correlation;
use crate::headers::{X_CORRELATION_ID, X_REQUEST_ID};

/// Request id of the current HTTP request, stored as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Parses `x-correlation-id` into a [`Correlation`] extension and makes sure
/// the request carries an `x-request-id`, which is echoed on the response.
///
/// The rest of the stack runs inside a `request` span with `request_id` and
/// `correlation` fields, so every log line of the request carries both.
pub async fn correlation_middleware(mut request: Request, next: Next) -> Response {
  let correlation = request
    .headers()
    .get(X_CORRELATION_ID)
    .and_then(|value| value.to_str().ok())
    .map(Correlation::parse)
    .unwrap_or_default();

  let request_id = request
    .headers()
    .get(X_REQUEST_ID)
    .and_then(|value| value.to_str().ok())
    .filter(|value| !value.is_empty())
    .map(str::to_owned)
    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

  let header = HeaderValue::from_str(&request_id).ok();
  if let Some(value) = &header {
    request.headers_mut().insert(X_REQUEST_ID, value.clone());
  }

  let span = info_span!("request", request_id = %request_id, correlation = %correlation);

  request.extensions_mut().insert(correlation);
  request.extensions_mut().insert(RequestId(request_id));

  let mut response = next.run(request).instrument(span).await;
  if let Some(value) = header {
    response.headers_mut().insert(X_REQUEST_ID, value);
  }
  response
}

/// Wraps every route of `router` with [`correlation_middleware`].
pub fn correlation_layer<S>(router: Router<S>) -> Router<S>
where
  S: Clone + Send + Sync + 'static,
{
  router.layer(middleware::from_fn(correlation_middleware))
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::{Extension, body::Body, routing::get};
  use std::fmt;
  use std::sync::{Arc, Mutex};
  use tower::ServiceExt;
  use tracing::Subscriber;
  use tracing::field::{Field, Visit};
  use tracing::span::{Attributes, Id};
  use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

  fn app() -> Router {
    let router = Router::new().route(
      "/",
      get(|Extension(correlation): Extension<Correlation>, Extension(id): Extension<RequestId>| async move {
        format!("{}|{}", correlation.tenancy().unwrap_or("-"), id.as_str())
      }),
    );
    correlation_layer(router)
  }

  async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
  }

  #[tokio::test]
  async fn test_generates_request_id() {
    let response = app()
      .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
      .await
      .unwrap();

    let echoed = response.headers().get(X_REQUEST_ID).unwrap().to_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&echoed).is_ok());

    let body = body_string(response).await;
    assert_eq!(body, format!("-|{echoed}"));
  }

  #[tokio::test]
  async fn test_keeps_incoming_ids() {
    let response = app()
      .oneshot(
        Request::builder()
          .uri("/")
          .header(X_REQUEST_ID, "req-7")
          .header(X_CORRELATION_ID, "tenancy=acme")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-7");
    assert_eq!(body_string(response).await, "acme|req-7");
  }

  #[derive(Clone, Default)]
  struct SpanFields(Arc<Mutex<Vec<String>>>);

  struct FieldText(String);

  impl Visit for FieldText {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
      self.0.push_str(&format!("{}={:?} ", field.name(), value));
    }
  }

  impl<S: Subscriber> Layer<S> for SpanFields {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
      let mut text = FieldText(format!("{}: ", attrs.metadata().name()));
      attrs.record(&mut text);
      self.0.lock().unwrap().push(text.0);
    }
  }

  #[tokio::test]
  async fn test_request_span_carries_ids() {
    let spans = SpanFields::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

    app()
      .oneshot(
        Request::builder()
          .uri("/")
          .header(X_REQUEST_ID, "req-9")
          .header(X_CORRELATION_ID, "tenancy=acme")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    let recorded = spans.0.lock().unwrap();
    assert!(
      recorded.iter().any(|span| span.starts_with("request: ")
        && span.contains("request_id=req-9")
        && span.contains("correlation=tenancy=acme")),
      "{recorded:?}"
    );
  }
}
