use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::gateway::GatewayError;

/// Boxed error returned by shutdown hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Protocol served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Http,
    Grpc,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => f.write_str("HTTP"),
            ListenerKind::Grpc => f.write_str("gRPC"),
        }
    }
}

/// Errors produced while building, serving or shutting down a [`Server`](super::Server).
///
/// The type is `Clone` so every caller of the shutdown entry points can
/// observe the single recorded outcome. Sources are shared through `Arc`.
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    #[error("duplicate {kind} server name: {name}")]
    DuplicateName { kind: ListenerKind, name: String },

    #[error("duplicate bind address: {0}")]
    DuplicateAddress(String),

    #[error("HTTP server {0} has no handler")]
    MissingHandler(String),

    #[error("gRPC server {0} has no service instance or setup function")]
    MissingSource(String),

    #[error("failed to create gateway: {0}")]
    Gateway(#[from] GatewayError),

    #[error("no servers configured")]
    NoServers,

    #[error("server already started")]
    AlreadyStarted,

    #[error("server already stopped")]
    AlreadyStopped,

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] Arc<std::io::Error>),

    #[error("{kind} server {name} listen error: {source}")]
    Listen {
        kind: ListenerKind,
        name: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{kind} server {name} serve error: {source}")]
    Serve {
        kind: ListenerKind,
        name: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{kind} server {name} graceful shutdown timed out")]
    DrainTimedOut { kind: ListenerKind, name: String },

    #[error("shutdown timed out")]
    ShutdownTimeout,

    #[error("shutdown task ended without a result: {0}")]
    ShutdownAborted(String),

    #[error("hook {0} timed out")]
    HookTimedOut(String),

    #[error("hook {name} failed: {source}")]
    HookFailed {
        name: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("{}", display_joined(.0))]
    Multiple(Vec<ServerError>),
}

fn display_joined(errors: &[ServerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ServerError {
    pub(crate) fn listen(kind: ListenerKind, name: &str, source: std::io::Error) -> Self {
        ServerError::Listen {
            kind,
            name: name.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn serve(kind: ListenerKind, name: &str, source: std::io::Error) -> Self {
        ServerError::Serve {
            kind,
            name: name.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn hook_failed(name: &str, source: BoxError) -> Self {
        ServerError::HookFailed {
            name: name.to_string(),
            source: Arc::from(source),
        }
    }

    /// Folds a list of errors: nothing is `Ok`, one error is returned as is,
    /// several are wrapped in [`ServerError::Multiple`] (nested lists are flattened).
    pub fn join(errors: impl IntoIterator<Item = ServerError>) -> Result<(), ServerError> {
        let mut flat = Vec::new();
        for error in errors {
            match error {
                ServerError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(ServerError::Multiple(flat)),
        }
    }

    /// The individual errors, looking through [`ServerError::Multiple`].
    pub fn errors(&self) -> Vec<&ServerError> {
        match self {
            ServerError::Multiple(inner) => inner.iter().flat_map(ServerError::errors).collect(),
            other => vec![other],
        }
    }

    /// True when the overall shutdown deadline expired, alone or among other errors.
    pub fn is_shutdown_timeout(&self) -> bool {
        self
            .errors()
            .iter()
            .any(|e| matches!(e, ServerError::ShutdownTimeout))
    }
}
