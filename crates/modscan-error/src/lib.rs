//! Unified error taxonomy with stable error codes for the modscan orchestrator.
//!
//! Every `ModscanError` carries an [`ErrorKind`] (a machine-readable,
//! stable string code), a human-readable message, an optional cause chain,
//! and arbitrary key-value context. Use the builder returned by
//! [`ModscanError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The seven error kinds used throughout the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed upload, unknown file type, chain references nonexistent
    /// module.
    InvalidInput,
    /// Unknown fingerprint, module, chain, or task.
    NotFound,
    /// Container lifecycle transition not permitted; `ChainRun` cancel on
    /// terminal state; duplicate in-flight `ChainRun`.
    IllegalState,
    /// Module inactive or unhealthy; queue backend unreachable.
    Unavailable,
    /// Step deadline elapsed without result.
    Timeout,
    /// Module returned `status=error`.
    WorkerError,
    /// Invariant violation, serialization bug; caller-facing message is
    /// generic.
    Internal,
}

impl ErrorKind {
    /// Stable `&'static str` code, e.g. `"INVALID_INPUT"`.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::IllegalState => "ILLEGAL_STATE",
            Self::Unavailable => "UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::WorkerError => "WORKER_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status this kind maps to across the API boundary.
    ///
    /// `WorkerError` and `Timeout` have no single status in the propagation
    /// table — callers handling those surface domain-appropriate success
    /// responses with error details in the body rather than an HTTP error.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::NotFound => 404,
            Self::IllegalState => 409,
            Self::Unavailable => 503,
            Self::Internal => 500,
            Self::Timeout | Self::WorkerError => 200,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Unified orchestrator error.
///
/// Carries a stable [`ErrorKind`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use modscan_error::{ErrorKind, ModscanError};
///
/// let err = ModscanError::new(ErrorKind::Timeout, "step deadline elapsed")
///     .with_context("module_id", "permissions")
///     .with_context("deadline_secs", 30);
/// ```
pub struct ModscanError {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ModscanError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// Silently skipped if `value` fails to serialize.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand constructors for each kind.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// See [`ErrorKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// See [`ErrorKind::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState, message)
    }

    /// See [`ErrorKind::Unavailable`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// See [`ErrorKind::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Debug for ModscanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ModscanError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for ModscanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ModscanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`ModscanError`] (without the opaque source),
/// suitable for an HTTP error body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModscanErrorDto {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&ModscanError> for ModscanErrorDto {
    fn from(err: &ModscanError) -> Self {
        Self {
            code: err.kind.code().to_string(),
            message: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

#[cfg(feature = "axum")]
mod axum_support {
    use super::{ErrorKind, ModscanError, ModscanErrorDto};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::Json;

    impl IntoResponse for ModscanError {
        fn into_response(self) -> Response {
            let status = StatusCode::from_u16(self.kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = ModscanErrorDto::from(&self);
            (status, Json(body)).into_response()
        }
    }

    /// Status code an [`ErrorKind`] maps to at the daemon/external API
    /// boundary.
    #[must_use]
    pub fn status_for(kind: ErrorKind) -> StatusCode {
        StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(feature = "axum")]
pub use axum_support::status_for;
