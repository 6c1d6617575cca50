//! Unified error type for the transcoding core.
//!
//! Every failure is classified into an [`ErrorKind`] so callers can decide
//! whether to retry ([`Error::is_recoverable`], [`Error::suggested_delay`])
//! and API layers can derive a status code ([`Error::http_status`]).
//! Operation context (operation name, session, detail map) is attached with
//! [`Error::in_op`], [`Error::with_session`] and [`Error::with_detail`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay suggested to callers when a provider is temporarily unavailable.
const PROVIDER_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Broad failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad parameters; rejected synchronously and never queued.
    Validation,
    /// Capacity or queue exhaustion; retryable.
    Resource,
    /// Provider lookup or availability failure.
    Provider,
    /// Encoder failure.
    Transcode,
    /// Session lifecycle failure (unknown session, cancelled wait).
    Session,
    /// Filesystem or persistence failure.
    Storage,
    /// Unexpected internal failure, including recovered panics.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Provider => "provider",
            Self::Transcode => "transcode",
            Self::Session => "session",
            Self::Storage => "storage",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Unified error type covering all failure modes of the transcoding core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "session", "content").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Admission refused because the node is at capacity.
    #[error("Resource limit exceeded: {message}")]
    ResourceExhausted {
        message: String,
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },

    /// The admission queue has no free slot.
    #[error("Transcode queue is full ({capacity} pending)")]
    QueueFull {
        capacity: usize,
        retry_after: Duration,
    },

    /// No provider is registered under the given ID.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// The provider exists but cannot take work right now.
    #[error("Provider unavailable [{provider}]: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// No registered provider supports the requested container.
    #[error("No providers available for container '{0}'")]
    NoProvidersAvailable(String),

    /// The provider does not implement an optional operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The encoder failed.
    #[error("Transcode failed [{provider}] session {session_id}: {message}")]
    Transcode {
        provider: String,
        session_id: String,
        message: String,
    },

    /// A wait exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A wait was abandoned because its caller or the manager cancelled it.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A process survived the full SIGTERM then SIGKILL escalation.
    #[error("Process {pid} could not be killed")]
    Unkillable { pid: i32 },

    /// A persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool { tool: String, message: String },

    /// Media probing failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// A background task panicked; the panic was caught and converted.
    #[error("Panic in {task}: {message}")]
    Panic {
        task: String,
        message: String,
        stack: Option<String>,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Another error annotated with the operation that produced it.
    #[error("{op}: {source}")]
    Context {
        op: String,
        session_id: Option<String>,
        details: BTreeMap<String, String>,
        source: Box<Error>,
    },
}

impl Error {
    /// Category of this error. Context wrappers report their inner kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound { entity, .. } if entity == "session" => ErrorKind::Session,
            Error::NotFound { .. } => ErrorKind::Storage,
            Error::ResourceExhausted { .. } | Error::QueueFull { .. } | Error::Timeout(_) => {
                ErrorKind::Resource
            }
            Error::ProviderNotFound(_)
            | Error::ProviderUnavailable { .. }
            | Error::NoProvidersAvailable(_)
            | Error::Unsupported(_) => ErrorKind::Provider,
            Error::Transcode { .. } | Error::Tool { .. } | Error::Unkillable { .. } => {
                ErrorKind::Transcode
            }
            Error::Cancelled(_) => ErrorKind::Session,
            Error::Storage(_) | Error::Io { .. } | Error::Probe(_) => ErrorKind::Storage,
            Error::Panic { .. } | Error::Internal(_) => ErrorKind::Internal,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Timeout(_)
            | Error::ResourceExhausted { .. }
            | Error::QueueFull { .. }
            | Error::ProviderUnavailable { .. }
            | Error::Internal(_)
            | Error::Panic { .. } => true,
            Error::Context { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Backoff hint for retryable resource and provider errors.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Error::ResourceExhausted { retry_after, .. } | Error::QueueFull { retry_after, .. } => {
                Some(*retry_after)
            }
            Error::ProviderUnavailable { .. } => Some(PROVIDER_RETRY_AFTER),
            Error::Context { source, .. } => source.suggested_delay(),
            _ => None,
        }
    }

    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound { .. } | Error::ProviderNotFound(_) => 404,
            Error::ResourceExhausted { .. } | Error::QueueFull { .. } => 429,
            Error::ProviderUnavailable { .. } | Error::NoProvidersAvailable(_) => 503,
            Error::Unsupported(_) => 501,
            Error::Transcode { .. } | Error::Tool { .. } => 502,
            Error::Timeout(_) => 504,
            Error::Cancelled(_) => 499,
            Error::Probe(_) => 422,
            Error::Unkillable { .. }
            | Error::Storage(_)
            | Error::Io { .. }
            | Error::Panic { .. }
            | Error::Internal(_) => 500,
            Error::Context { source, .. } => source.http_status(),
        }
    }

    /// Session the error relates to, if any was recorded.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Error::Context {
                session_id: Some(id),
                ..
            } => Some(id),
            Error::Context { source, .. } => source.session_id(),
            Error::Transcode { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Innermost error beneath any context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Annotate with the operation that failed.
    ///
    /// An error that already carries context keeps its original (innermost)
    /// operation name.
    pub fn in_op(self, op: impl Into<String>) -> Self {
        match self {
            ctx @ Error::Context { .. } => ctx,
            other => Error::Context {
                op: op.into(),
                session_id: None,
                details: BTreeMap::new(),
                source: Box::new(other),
            },
        }
    }

    /// Record the session the failure belongs to.
    pub fn with_session(self, session_id: impl fmt::Display) -> Self {
        let mut err = self.ensure_context();
        if let Error::Context { session_id: slot, .. } = &mut err {
            *slot = Some(session_id.to_string());
        }
        err
    }

    /// Attach a key/value detail.
    pub fn with_detail(self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        let mut err = self.ensure_context();
        if let Error::Context { details, .. } = &mut err {
            details.insert(key.into(), value.to_string());
        }
        err
    }

    /// Detail map recorded on the outermost context, if any.
    pub fn details(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Error::Context { details, .. } => Some(details),
            _ => None,
        }
    }

    fn ensure_context(self) -> Self {
        let op = self.kind().to_string();
        self.in_op(op)
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Transcode`].
    pub fn transcode(
        provider: impl Into<String>,
        session_id: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Error::Transcode {
            provider: provider.into(),
            session_id: session_id.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::ProviderUnavailable`].
    pub fn provider_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
