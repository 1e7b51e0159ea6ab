//! Error types for the push pipeline.
//!
//! Every pipeline stage fails with a [`PushError`].  Each variant maps to a
//! stable kind string and a process exit code so `main` can report the
//! failure and terminate without inspecting the message.  Remote calls
//! produce [`RemoteError`] values (wrapped in `anyhow`) which carry enough
//! detail to decide whether a retry makes sense.

use thiserror::Error;

/// Fatal pipeline error.
#[derive(Debug, Error)]
pub enum PushError {
    /// Missing environment variable, bad flag, or unreadable config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The identity endpoint rejected the credentials or was unreachable.
    #[error("authentication failed: {0:#}")]
    Authentication(anyhow::Error),

    /// The local image is malformed or too large to upload.
    #[error("invalid image {path}: {message}")]
    Validation { path: String, message: String },

    /// The local image could not be read.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A management or storage call failed.
    #[error("{context}: {source:#}")]
    Remote {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// The content checksum could not be recorded on the uploaded blob.
    #[error("integrity tagging failed: {0:#}")]
    Integrity(anyhow::Error),
}

impl PushError {
    /// Short machine-friendly name for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            PushError::Configuration(_) => "ConfigurationError",
            PushError::Authentication(_) => "AuthenticationError",
            PushError::Validation { .. } => "ValidationError",
            PushError::Io { .. } => "IOError",
            PushError::Remote { .. } => "IOError",
            PushError::Integrity(_) => "IntegrityError",
        }
    }

    /// Process exit status for this error. Always non-zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            PushError::Configuration(_) => 1,
            PushError::Authentication(_) => 2,
            PushError::Validation { .. } => 3,
            PushError::Io { .. } => 4,
            PushError::Remote { .. } => 4,
            PushError::Integrity(_) => 5,
        }
    }

    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        PushError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PushError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn remote(context: impl Into<String>, source: anyhow::Error) -> Self {
        PushError::Remote {
            context: context.into(),
            source,
        }
    }
}

/// A failed HTTP exchange with a cloud service.
///
/// `status` is `None` when the request never produced a response
/// (connection refused, timeout, TLS failure).
#[derive(Debug, Error)]
#[error("{service} {operation}: {}", describe(.status, .body))]
pub struct RemoteError {
    pub service: &'static str,
    pub operation: &'static str,
    pub status: Option<u16>,
    pub body: String,
}

fn describe(status: &Option<u16>, body: &str) -> String {
    match status {
        Some(code) => format!("HTTP {} - {}", code, body),
        None => format!("request failed - {}", body),
    }
}

impl RemoteError {
    pub fn http(
        service: &'static str,
        operation: &'static str,
        status: reqwest::StatusCode,
        body: String,
    ) -> Self {
        Self {
            service,
            operation,
            status: Some(status.as_u16()),
            body,
        }
    }

    pub fn transport(service: &'static str, operation: &'static str, err: reqwest::Error) -> Self {
        Self {
            service,
            operation,
            status: None,
            body: err.to_string(),
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(code) => matches!(code, 408 | 429 | 500 | 502 | 503 | 504),
        }
    }
}

/// Classify an arbitrary error chain as transient.
///
/// Only [`RemoteError`]s are ever considered transient; local failures
/// and protocol errors are permanent.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|e| e.downcast_ref::<RemoteError>())
        .map(RemoteError::is_transient)
        .unwrap_or(false)
}

// -- Tests -------------------------------------------------------------------
