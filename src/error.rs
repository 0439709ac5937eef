//! Error taxonomy shared by the store, orchestration, and ledger layers.
//!
//! Every failure that crosses a library seam is a [`RagError`]. Each variant
//! maps to one [`ErrorKind`], and any error can be rendered as a
//! [`Signal`]: the structured `{kind, message}` pair that the CLI and the
//! job runner surface instead of a raw backtrace.
//!
//! | Kind | Raised for | Retried? |
//! |------|------------|----------|
//! | `validation` | empty query text, mismatched batch lengths | never |
//! | `not_found` | missing project/collection | normalized away by the orchestration layer |
//! | `provider` | embedding, generation, or vector store call failed | by the job runner |
//! | `persistence` | ledger/relational read or write failed | by the job runner |
//! | `config` | invalid or incomplete configuration | never |

use serde::Serialize;

/// Result alias for library operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Coarse classification of a [`RagError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Provider,
    Persistence,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Provider => "provider",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Config => "config",
        }
    }

    /// Whether a job failing with this kind should be handed back to the
    /// runner's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Provider | ErrorKind::Persistence)
    }
}

/// Main error type for ragdock operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Caller supplied invalid input.
    #[error("validation error: {0}")]
    Validation(String),

    /// A project, asset, or collection does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An embedding, generation, or vector store call failed.
    #[error("provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A relational or ledger read/write failed.
    #[error("persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The configuration is invalid or incomplete.
    #[error("config error: {0}")]
    Config(String),
}

impl RagError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Provider failure without an underlying error value.
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap any error raised while talking to an external provider.
    pub fn provider_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Provider {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    pub fn persistence_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::Validation(_) => ErrorKind::Validation,
            RagError::NotFound(_) => ErrorKind::NotFound,
            RagError::Provider { .. } => ErrorKind::Provider,
            RagError::Persistence { .. } => ErrorKind::Persistence,
            RagError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn signal(&self) -> Signal {
        Signal {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        let message = format!("database operation failed: {}", err);
        Self::persistence_from(message, err)
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        let message = format!("http request failed: {}", err);
        Self::provider_from(message, err)
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        let message = format!("json encoding failed: {}", err);
        Self::persistence_from(message, err)
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        let message = format!("io error: {}", err);
        Self::persistence_from(message, err)
    }
}

/// Structured, user-visible failure signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub kind: ErrorKind,
    pub message: String,
}

impl Signal {
    /// Best-effort signal for an `anyhow` error coming out of application
    /// glue: if a [`RagError`] is anywhere in the chain its kind wins,
    /// otherwise the failure is reported as a provider error.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<RagError>())
            .map(RagError::kind)
            .unwrap_or(ErrorKind::Provider);
        Signal {
            kind,
            message: format!("{:#}", err),
        }
    }
}
