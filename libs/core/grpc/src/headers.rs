//! Header and metadata keys shared by HTTP and gRPC hops.
//!
//! All keys are lowercase so they are valid both as HTTP header names and
//! as gRPC ASCII metadata keys.

/// Unique id of a single request, generated at the edge when missing.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Correlation key/value pairs, encoded as `k1=v1,k2=v2`.
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// Trace id of an external tracing system, forwarded untouched.
pub const X_TRACE_ID: &str = "x-trace-id";

/// Headers the gateway forwards to its upstream unless configured otherwise.
pub const DEFAULT_FORWARDED_HEADERS: [&str; 3] = [X_REQUEST_ID, X_CORRELATION_ID, X_TRACE_ID];
