//! Server construction and validation.

use axum::Router;
use std::collections::HashSet;
use std::time::Duration;
use tonic::service::Routes;
use tracing::Span;

use super::config::{DEFAULT_SHUTDOWN_TIMEOUT, GrpcConfig, HttpConfig, ServerSettings};
use super::error::{ListenerKind, ServerError};
use super::hook::ShutdownHook;
use super::{GrpcRegistration, HttpRegistration, Registrations, Server};
use crate::gateway::Gateway;

/// Builder for [`Server`].
///
/// Mutations are applied in call order; validation happens in [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// use grpc_platform::server::{HttpConfig, Server};
///
/// let server = Server::builder()
///     .with_logger(tracing::info_span!("orders"))
///     .with_shutdown_timeout(Duration::from_secs(15))
///     .with_http_config(
///         HttpConfig::new("web", "8080", router).with_write_timeout(Duration::from_secs(30)),
///     )
///     .with_gateway("rest", "8081", gateway)
///     .build()?;
/// ```
pub struct ServerBuilder {
    span: Option<Span>,
    shutdown_timeout: Duration,
    automatic_stop: bool,
    signal_handling: bool,
    http: Vec<HttpConfig>,
    grpc: Vec<GrpcConfig>,
    hooks: Vec<ShutdownHook>,
    error: Option<ServerError>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            span: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            automatic_stop: true,
            signal_handling: true,
            http: Vec::new(),
            grpc: Vec::new(),
            hooks: Vec::new(),
            error: None,
        }
    }

    /// Span every lifecycle event is recorded in. Defaults to an `info` span named `server`.
    pub fn with_logger(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Overall deadline of a graceful shutdown. Zero keeps the current value.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.shutdown_timeout = timeout;
        }
        self
    }

    /// When disabled, `serve` returns control of shutdown to the caller.
    pub fn with_automatic_stop(mut self, enabled: bool) -> Self {
        self.automatic_stop = enabled;
        self
    }

    /// When disabled, OS signals are left to the application.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.signal_handling = enabled;
        self
    }

    /// Applies lifecycle settings loaded with `ServerSettings::from_env`.
    pub fn with_settings(self, settings: ServerSettings) -> Self {
        self.with_shutdown_timeout(settings.shutdown_timeout)
            .with_signal_handling(settings.signal_handling)
            .with_automatic_stop(settings.automatic_stop)
    }

    pub fn with_http_config(mut self, config: HttpConfig) -> Self {
        self.http.push(config);
        self
    }

    /// HTTP listener with default timeouts; `port` may be `"8080"` or `":8080"`.
    pub fn with_http_server(
        self,
        name: impl Into<String>,
        port: &str,
        handler: impl Into<Option<Router>>,
    ) -> Self {
        self.with_http_config(HttpConfig::new(name, port, handler))
    }

    pub fn with_grpc_config(mut self, config: GrpcConfig) -> Self {
        self.grpc.push(config);
        self
    }

    /// gRPC listener serving `instance`, or the routes registered by `setup`.
    ///
    /// Passing neither fails [`build`](Self::build).
    pub fn with_grpc_server<F>(
        self,
        name: impl Into<String>,
        port: &str,
        instance: Option<Routes>,
        setup: Option<F>,
    ) -> Self
    where
        F: FnOnce(Routes) -> Routes + Send + 'static,
    {
        self.with_grpc_config(GrpcConfig::new(name, port, instance, setup))
    }

    /// HTTP listener serving the REST routes of `gateway`.
    ///
    /// The gateway is built here; a build failure is reported by [`build`](Self::build).
    /// Must be called inside a Tokio runtime.
    pub fn with_gateway(mut self, name: impl Into<String>, port: &str, gateway: Gateway) -> Self {
        match gateway.build() {
            Ok(router) => self.with_http_server(name, port, router),
            Err(err) => {
                self.error.get_or_insert(ServerError::Gateway(err));
                self
            }
        }
    }

    pub fn with_shutdown_hook(mut self, hook: ShutdownHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Validates the registrations and creates the server. No socket is opened here.
    pub fn build(self) -> Result<Server, ServerError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        let mut registrations = Registrations::default();

        for config in self.http {
            if !names.insert(config.name.clone()) {
                return Err(ServerError::DuplicateName {
                    kind: ListenerKind::Http,
                    name: config.name,
                });
            }
            if !config.address.is_empty() && !addresses.insert(config.address.clone()) {
                return Err(ServerError::DuplicateAddress(config.address));
            }
            let Some(handler) = config.handler.clone() else {
                return Err(ServerError::MissingHandler(config.name));
            };
            registrations.http.push(HttpRegistration {
                config: config.apply_defaults(),
                handler,
            });
        }

        for config in self.grpc {
            if !names.insert(config.name.clone()) {
                return Err(ServerError::DuplicateName {
                    kind: ListenerKind::Grpc,
                    name: config.name,
                });
            }
            if !config.address.is_empty() && !addresses.insert(config.address.clone()) {
                return Err(ServerError::DuplicateAddress(config.address));
            }
            let Some(source) = config.source else {
                return Err(ServerError::MissingSource(config.name));
            };
            registrations.grpc.push(GrpcRegistration {
                name: config.name,
                address: config.address,
                source,
                options: config.options,
            });
        }

        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("server"));

        Ok(Server::from_parts(
            span,
            self.shutdown_timeout,
            self.automatic_stop,
            self.signal_handling,
            self.hooks,
            registrations,
        ))
    }
}
