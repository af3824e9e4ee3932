//! Listener registrations and lifecycle settings.

use axum::Router;
use core_config::{ConfigError, FromEnv, env_bool, env_duration_secs};
use std::fmt;
use std::time::Duration;
use tonic::service::Routes;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_GRPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns a bare port into a listen address: `"8080"` becomes `":8080"`.
///
/// Addresses that already contain a `:` and the empty string are returned unchanged.
pub fn normalize_port(port: &str) -> String {
    if port.is_empty() || port.contains(':') {
        port.to_string()
    } else {
        format!(":{}", port)
    }
}

/// Addresses handed to the socket layer, in the order they are tried.
///
/// A leading `:` (or an empty address, for an ephemeral port) means every
/// interface: the IPv6 wildcard first, which is dual-stack on most systems,
/// then the IPv4 wildcard for hosts without IPv6.
pub(crate) fn bind_addresses(address: &str) -> Vec<String> {
    let port = if address.is_empty() {
        ":0"
    } else if address.starts_with(':') {
        address
    } else {
        return vec![address.to_string()];
    };
    vec![format!("[::]{port}"), format!("0.0.0.0{port}")]
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() { default } else { value }
}

/// An HTTP listener registration.
///
/// Zero timeouts are replaced with the defaults when the server is built.
#[derive(Clone)]
pub struct HttpConfig {
    pub name: String,
    pub address: String,
    pub handler: Option<Router>,
    /// Limit for receiving the request body.
    pub read_timeout: Duration,
    /// Limit for producing the response; expiry answers `408 Request Timeout`.
    pub write_timeout: Duration,
    /// Keep-alive connections without traffic for this long are closed.
    pub idle_timeout: Duration,
    pub read_header_timeout: Duration,
}

impl HttpConfig {
    pub fn new(name: impl Into<String>, port: &str, handler: impl Into<Option<Router>>) -> Self {
        Self {
            name: name.into(),
            address: normalize_port(port),
            handler: handler.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_read_header_timeout(mut self, timeout: Duration) -> Self {
        self.read_header_timeout = timeout;
        self
    }

    pub(crate) fn apply_defaults(mut self) -> Self {
        self.read_timeout = or_default(self.read_timeout, DEFAULT_READ_TIMEOUT);
        self.write_timeout = or_default(self.write_timeout, DEFAULT_WRITE_TIMEOUT);
        self.idle_timeout = or_default(self.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        self.read_header_timeout = or_default(self.read_header_timeout, DEFAULT_READ_HEADER_TIMEOUT);
        self
    }
}

impl fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("has_handler", &self.handler.is_some())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("read_header_timeout", &self.read_header_timeout)
            .finish()
    }
}

/// Registers services on the route table of a gRPC listener.
pub type SetupFn = Box<dyn FnOnce(Routes) -> Routes + Send>;

/// Where a gRPC listener gets its services from.
pub enum GrpcSource {
    /// A ready route table, served as is.
    Instance(Routes),
    /// Invoked on the listener task with an empty route table.
    Setup(SetupFn),
}

impl fmt::Debug for GrpcSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrpcSource::Instance(_) => f.write_str("Instance"),
            GrpcSource::Setup(_) => f.write_str("Setup"),
        }
    }
}

/// HTTP/2 and TCP tuning plus per-call limits for a gRPC listener.
#[derive(Debug, Clone)]
pub struct GrpcServerOptions {
    /// Server-side deadline for a call; a shorter `grpc-timeout` from the
    /// client wins. `None` leaves calls unbounded.
    pub request_timeout: Option<Duration>,
    /// Answer handler panics with `INTERNAL` instead of dropping the connection.
    pub panic_recovery: bool,
    pub max_concurrent_streams: Option<u32>,
    pub http2_keepalive_interval: Option<Duration>,
    pub http2_keepalive_timeout: Duration,
    pub initial_stream_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub http2_adaptive_window: bool,
    pub tcp_nodelay: bool,
}

impl Default for GrpcServerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_GRPC_REQUEST_TIMEOUT),
            panic_recovery: true,
            max_concurrent_streams: None,
            http2_keepalive_interval: Some(Duration::from_secs(60)),
            http2_keepalive_timeout: Duration::from_secs(20),
            initial_stream_window_size: Some(1024 * 1024),     // 1MB
            initial_connection_window_size: Some(1024 * 1024), // 1MB
            http2_adaptive_window: false,
            tcp_nodelay: true,
        }
    }
}

impl GrpcServerOptions {
    /// A zero `timeout` disables the server-side deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_panic_recovery(mut self, enabled: bool) -> Self {
        self.panic_recovery = enabled;
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = Some(max);
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.http2_keepalive_interval = Some(interval);
        self.http2_keepalive_timeout = timeout;
        self
    }

    pub fn with_window_size(mut self, size: u32) -> Self {
        self.initial_stream_window_size = Some(size);
        self.initial_connection_window_size = Some(size);
        self
    }

    pub fn with_adaptive_window(mut self, enabled: bool) -> Self {
        self.http2_adaptive_window = enabled;
        self
    }
}

/// A gRPC listener registration.
#[derive(Debug)]
pub struct GrpcConfig {
    pub name: String,
    pub address: String,
    pub source: Option<GrpcSource>,
    pub options: GrpcServerOptions,
}

impl GrpcConfig {
    /// When both an instance and a setup function are given, the setup
    /// function runs against the instance's route table.
    pub fn new<F>(
        name: impl Into<String>,
        port: &str,
        instance: Option<Routes>,
        setup: Option<F>,
    ) -> Self
    where
        F: FnOnce(Routes) -> Routes + Send + 'static,
    {
        let source = match (instance, setup) {
            (Some(routes), None) => Some(GrpcSource::Instance(routes)),
            (None, Some(setup)) => Some(GrpcSource::Setup(Box::new(setup))),
            (Some(routes), Some(setup)) => {
                Some(GrpcSource::Setup(Box::new(move |_| setup(routes))))
            }
            (None, None) => None,
        };

        Self {
            name: name.into(),
            address: normalize_port(port),
            source,
            options: GrpcServerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GrpcServerOptions) -> Self {
        self.options = options;
        self
    }
}

/// Lifecycle settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub shutdown_timeout: Duration,
    pub signal_handling: bool,
    pub automatic_stop: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            signal_handling: true,
            automatic_stop: true,
        }
    }
}

impl FromEnv for ServerSettings {
    /// Reads:
    /// - `SHUTDOWN_TIMEOUT_SECS` (default: 30)
    /// - `SIGNAL_HANDLING` (default: true)
    /// - `AUTOMATIC_STOP` (default: true)
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            shutdown_timeout: env_duration_secs("SHUTDOWN_TIMEOUT_SECS", DEFAULT_SHUTDOWN_TIMEOUT)?,
            signal_handling: env_bool("SIGNAL_HANDLING", true)?,
            automatic_stop: env_bool("AUTOMATIC_STOP", true)?,
        })
    }
}
