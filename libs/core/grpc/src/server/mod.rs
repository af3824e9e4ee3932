//! Multi-listener lifecycle manager.
//!
//! A [`Server`] owns any number of named HTTP and gRPC listeners, starts them
//! together and turns the first terminating event (OS signal, fatal listener
//! error or an explicit stop) into a single two-phase shutdown: listeners are
//! stopped (aborted or drained), then prioritised [`ShutdownHook`]s run under
//! the overall shutdown deadline.
//!
//! ## Quick Start
//!
//! ```ignore
//! use grpc_platform::server::{Server, ShutdownHook};
//! use tonic::service::Routes;
//!
//! let (_reporter, health) = tonic_health::server::health_reporter();
//!
//! let server = Server::builder()
//!     .with_http_server("web", "8080", web_router)
//!     .with_grpc_server("api", "50051", None, Some(move |routes: Routes| routes.add_service(health)))
//!     .with_shutdown_hook(ShutdownHook::new("db", 10, Duration::from_secs(5), move |_ctx| {
//!         let pool = pool.clone();
//!         async move { pool.close().await; Ok(()) }
//!     }))
//!     .build()?;
//!
//! // Returns once every listener has exited (SIGTERM, fatal error or `stop()`).
//! server.serve().await?;
//! ```
//!
//! ## Stopping from another task
//!
//! ```ignore
//! let server = Arc::new(server);
//! let serving = tokio::spawn({
//!     let server = Arc::clone(&server);
//!     async move { server.serve().await }
//! });
//!
//! server.graceful_shutdown(&ShutdownContext::background()).await?;
//! serving.await??;
//! ```

mod builder;
mod config;
mod context;
mod error;
mod hook;
mod listener;
mod middleware;
mod signals;

pub use builder::ServerBuilder;
pub use config::{
    DEFAULT_GRPC_REQUEST_TIMEOUT, DEFAULT_HOOK_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_READ_HEADER_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, GrpcConfig, GrpcServerOptions, GrpcSource, HttpConfig, ServerSettings,
    SetupFn, normalize_port,
};
pub use context::{ContextError, ShutdownContext};
pub use error::{BoxError, ListenerKind, ServerError};
pub use hook::ShutdownHook;
pub use signals::Signal;

use axum::Router;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::service::Routes;
use tracing::{Instrument, Span, error, info, warn};

use listener::{ConnectionSettings, ListenerHandle};
use middleware::{grpc_app, http_app};
use signals::ShutdownSignals;

/// Capacity floor of the listener error channel.
const ERROR_CHANNEL_CAPACITY: usize = 20;
const SIGNAL_CHANNEL_CAPACITY: usize = 5;

/// How listeners are taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    /// Abort accept loops and open connections; hooks are skipped.
    Immediate,
    /// Stop accepting, drain connections, then run hooks.
    Graceful,
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownMode::Immediate => f.write_str("immediate"),
            ShutdownMode::Graceful => f.write_str("graceful"),
        }
    }
}

/// HTTP registration whose handler has been checked.
pub(crate) struct HttpRegistration {
    pub(crate) config: HttpConfig,
    pub(crate) handler: Router,
}

/// gRPC registration whose source has been checked.
pub(crate) struct GrpcRegistration {
    pub(crate) name: String,
    pub(crate) address: String,
    pub(crate) source: GrpcSource,
    pub(crate) options: GrpcServerOptions,
}

#[derive(Default)]
pub(crate) struct Registrations {
    pub(crate) http: Vec<HttpRegistration>,
    pub(crate) grpc: Vec<GrpcRegistration>,
}

impl Registrations {
    fn len(&self) -> usize {
        self.http.len() + self.grpc.len()
    }
}

/// Listeners that have been launched, by kind and name.
///
/// `closed` is set when shutdown snapshots the tables; a listener registered
/// afterwards starts out aborted so it cannot outlive the shutdown.
#[derive(Default)]
struct RunningServers {
    http: HashMap<String, ListenerHandle>,
    grpc: HashMap<String, ListenerHandle>,
    closed: bool,
}

/// Outcome of the shutdown engine, awaited by every shutdown caller.
type ShutdownOutcome = Shared<BoxFuture<'static, Result<(), ServerError>>>;

/// Logs task panics and waits for every task in `tasks`.
pub(crate) async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = %err, "Task panicked");
            }
        }
    }
}

/// Runs a set of HTTP and gRPC listeners and coordinates their shutdown.
///
/// Built with [`Server::builder`]. A server serves once: after shutdown it
/// cannot be restarted.
pub struct Server {
    span: Span,
    shutdown_timeout: Duration,
    automatic_stop: bool,
    signal_handling: bool,
    hooks: Arc<[ShutdownHook]>,
    listener_count: usize,
    pending: Mutex<Option<Registrations>>,
    running: RwLock<RunningServers>,
    shutdown_token: CancellationToken,
    shutdown: Mutex<Option<ShutdownOutcome>>,
    tracker: TaskTracker,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("automatic_stop", &self.automatic_stop)
            .field("signal_handling", &self.signal_handling)
            .field("hooks", &self.hooks)
            .field("listeners", &self.listener_count)
            .finish()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub(crate) fn from_parts(
        span: Span,
        shutdown_timeout: Duration,
        automatic_stop: bool,
        signal_handling: bool,
        hooks: Vec<ShutdownHook>,
        registrations: Registrations,
    ) -> Self {
        Self {
            span,
            shutdown_timeout,
            automatic_stop,
            signal_handling,
            hooks: hooks.into(),
            listener_count: registrations.len(),
            pending: Mutex::new(Some(registrations)),
            running: RwLock::new(RunningServers::default()),
            shutdown_token: CancellationToken::new(),
            shutdown: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Address a listener is bound to, once it has started.
    ///
    /// Useful with port `0`, where the kernel picks the port.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        running
            .http
            .get(name)
            .or_else(|| running.grpc.get(name))
            .and_then(ListenerHandle::local_addr)
    }

    /// Number of listener tasks that have not exited yet.
    pub fn active_listeners(&self) -> usize {
        self.tracker.len()
    }

    /// Starts every listener and blocks until all of them have exited.
    ///
    /// The first signal, listener error or shutdown request ends the wait. With
    /// automatic stop enabled a graceful shutdown follows; otherwise the caller
    /// is expected to call [`stop`](Self::stop) or
    /// [`graceful_shutdown`](Self::graceful_shutdown). Listener and shutdown
    /// errors are joined into the result.
    pub async fn serve(&self) -> Result<(), ServerError> {
        self.serve_inner().instrument(self.span.clone()).await
    }

    async fn serve_inner(&self) -> Result<(), ServerError> {
        if self.listener_count == 0 {
            return Err(ServerError::NoServers);
        }
        if self.shutdown_token.is_cancelled() {
            return Err(ServerError::AlreadyStopped);
        }
        let registrations = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;

        let mut signals = if self.signal_handling {
            Some(self.listen_for_signals()?)
        } else {
            None
        };

        let (error_tx, mut error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY.max(self.listener_count));
        for registration in registrations.http {
            self.start_http(registration, error_tx.clone());
        }
        for registration in registrations.grpc {
            self.start_grpc(registration, error_tx.clone());
        }
        drop(error_tx);
        self.tracker.close();
        info!(listeners = self.listener_count, "All servers started");

        let mut errors = Vec::new();
        tokio::select! {
            biased;
            Some(signal) = next_signal(&mut signals) => {
                info!(signal = %signal, "Received shutdown signal");
            }
            Some(err) = error_rx.recv() => {
                warn!(error = %err, "Server error, shutting down");
                errors.push(err);
                while let Ok(err) = error_rx.try_recv() {
                    errors.push(err);
                }
            }
            _ = self.shutdown_token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        if self.automatic_stop {
            if let Err(err) = self.graceful_shutdown(&ShutdownContext::background()).await {
                errors.push(err);
            }
        }

        self.tracker.wait().await;
        error_rx.close();
        while let Ok(err) = error_rx.try_recv() {
            errors.push(err);
        }
        drop(signals);
        info!("All servers stopped");

        ServerError::join(errors)
    }

    /// Closes every listener and open connection immediately. Hooks do not run.
    ///
    /// Only the first call to `stop` or `graceful_shutdown` does any work;
    /// every caller receives the outcome of that first call.
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.shutdown_token.cancel();
        self
            .shutdown_once(ShutdownMode::Immediate, ShutdownContext::background())
            .await
    }

    /// Drains every listener, then runs the shutdown hooks.
    ///
    /// `ctx` is further bounded by the configured shutdown timeout. Listeners
    /// still busy at the deadline are closed forcibly.
    pub async fn graceful_shutdown(&self, ctx: &ShutdownContext) -> Result<(), ServerError> {
        self.shutdown_token.cancel();
        let ctx = ctx.with_timeout(self.shutdown_timeout);
        self.shutdown_once(ShutdownMode::Graceful, ctx).await
    }

    /// Runs the registered hooks under `ctx`. See [`ShutdownHook`].
    pub async fn execute_shutdown_hooks(&self, ctx: &ShutdownContext) -> Result<(), ServerError> {
        hook::execute_hooks(&self.hooks, ctx, &self.span).await
    }

    async fn shutdown_once(&self, mode: ShutdownMode, ctx: ShutdownContext) -> Result<(), ServerError> {
        self.begin_shutdown(mode, ctx).await
    }

    /// Claims the shutdown on the first call and spawns the engine; later calls
    /// get the outcome of that first run.
    ///
    /// The engine runs detached from the caller, so a caller that stops waiting
    /// neither aborts the hooks nor lets a later call run them again.
    fn begin_shutdown(&self, mode: ShutdownMode, ctx: ShutdownContext) -> ShutdownOutcome {
        let mut slot = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = slot.as_ref() {
            return outcome.clone();
        }

        let handles: Vec<ListenerHandle> = {
            let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
            running.closed = true;
            running
                .http
                .values()
                .chain(running.grpc.values())
                .cloned()
                .collect()
        };

        let engine = run_shutdown(mode, ctx, handles, Arc::clone(&self.hooks), self.span.clone());
        let task = tokio::spawn(engine.instrument(self.span.clone()));
        let outcome = async move {
            task
                .await
                .unwrap_or_else(|err| Err(ServerError::ShutdownAborted(err.to_string())))
        }
        .boxed()
        .shared();

        *slot = Some(outcome.clone());
        outcome
    }

    fn listen_for_signals(&self) -> Result<mpsc::Receiver<Signal>, ServerError> {
        let mut signals =
            ShutdownSignals::new().map_err(|err| ServerError::Signals(Arc::new(err)))?;
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let token = self.shutdown_token.clone();

        tokio::spawn(
            async move {
                tokio::select! {
                    signal = signals.recv() => {
                        info!(signal = %signal, "Signal received, requesting shutdown");
                        let _ = tx.try_send(signal);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            }
            .instrument(self.span.clone()),
        );

        Ok(rx)
    }

    /// Creates the handle for a listener and publishes it in the running table.
    fn register(&self, kind: ListenerKind, name: &str) -> ListenerHandle {
        let handle = ListenerHandle::new(kind, name);
        let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
        if running.closed {
            handle.abort();
        }
        let table = match kind {
            ListenerKind::Http => &mut running.http,
            ListenerKind::Grpc => &mut running.grpc,
        };
        table.insert(name.to_string(), handle.clone());
        handle
    }

    fn start_http(&self, registration: HttpRegistration, errors: mpsc::Sender<ServerError>) {
        let handle = self.register(ListenerKind::Http, &registration.config.name);
        self.tracker.spawn(
            async move {
                let _finished = handle.finished_guard();
                if let Err(err) = run_http(registration, &handle).await {
                    error!(name = %handle.name, error = %err, "HTTP server failed");
                    let _ = errors.send(err).await;
                }
            }
            .instrument(self.span.clone()),
        );
    }

    fn start_grpc(&self, registration: GrpcRegistration, errors: mpsc::Sender<ServerError>) {
        let handle = self.register(ListenerKind::Grpc, &registration.name);
        self.tracker.spawn(
            async move {
                let _finished = handle.finished_guard();
                if let Err(err) = run_grpc(registration, &handle).await {
                    error!(name = %handle.name, error = %err, "gRPC server failed");
                    let _ = errors.send(err).await;
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

async fn run_shutdown(
    mode: ShutdownMode,
    ctx: ShutdownContext,
    handles: Vec<ListenerHandle>,
    hooks: Arc<[ShutdownHook]>,
    span: Span,
) -> Result<(), ServerError> {
    info!(mode = %mode, listeners = handles.len(), "Shutting down servers");

    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    for handle in handles {
        let errors = Arc::clone(&errors);
        let ctx = ctx.clone();
        tasks.spawn(
            async move {
                match mode {
                    ShutdownMode::Immediate => {
                        handle.close().await;
                        info!(name = %handle.name, kind = %handle.kind, "Server stopped");
                    }
                    ShutdownMode::Graceful => match handle.shutdown(&ctx).await {
                        Ok(()) => info!(name = %handle.name, kind = %handle.kind, "Server drained"),
                        Err(err) => errors.lock().unwrap_or_else(PoisonError::into_inner).push(err),
                    },
                }
            }
            .instrument(span.clone()),
        );
    }

    let mut failures = Vec::new();
    let finished = tokio::select! {
        biased;
        _ = join_all(&mut tasks) => true,
        _ = ctx.done() => false,
    };
    if !finished {
        warn!(remaining = tasks.len(), "Shutdown deadline reached while stopping listeners");
        tasks.detach_all();
        failures.push(ServerError::ShutdownTimeout);
    }
    failures.extend(std::mem::take(
        &mut *errors.lock().unwrap_or_else(PoisonError::into_inner),
    ));

    if mode == ShutdownMode::Graceful {
        if let Err(err) = hook::execute_hooks(&hooks, &ctx, &span).await {
            failures.push(err);
        }
    }

    let result = ServerError::join(failures);
    match &result {
        Ok(()) => info!(mode = %mode, "Shutdown complete"),
        Err(err) => warn!(mode = %mode, error = %err, "Shutdown finished with errors"),
    }
    result
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<Signal>>) -> Option<Signal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_http(registration: HttpRegistration, handle: &ListenerHandle) -> Result<(), ServerError> {
    let HttpRegistration { config, handler } = registration;
    let app = http_app(handler, &config);

    info!(name = %config.name, address = %config.address, "Starting HTTP server");
    let listener = listener::bind(&config.address)
        .await
        .map_err(|err| ServerError::listen(ListenerKind::Http, &config.name, err))?;

    listener::serve(listener, app, ConnectionSettings::http(&config), handle)
        .await
        .map_err(|err| ServerError::serve(ListenerKind::Http, &config.name, err))?;

    info!(name = %config.name, "HTTP server stopped");
    Ok(())
}

async fn run_grpc(registration: GrpcRegistration, handle: &ListenerHandle) -> Result<(), ServerError> {
    let GrpcRegistration {
        name,
        address,
        source,
        options,
    } = registration;

    let routes = match source {
        GrpcSource::Instance(routes) => routes,
        GrpcSource::Setup(setup) => setup(Routes::default()),
    };
    let app = grpc_app(routes.into_axum_router(), &options);

    info!(name = %name, address = %address, "Starting gRPC server");
    let listener = listener::bind(&address)
        .await
        .map_err(|err| ServerError::listen(ListenerKind::Grpc, &name, err))?;

    listener::serve(listener, app, ConnectionSettings::grpc(&options), handle)
        .await
        .map_err(|err| ServerError::serve(ListenerKind::Grpc, &name, err))?;

    info!(name = %name, "gRPC server stopped");
    Ok(())
}
