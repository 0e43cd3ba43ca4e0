//! Error types and retry classification shared by all reconcilers
//!
//! Every failure is either Temporary (retry with backoff, no state
//! regression) or Permanent (surface as a condition, wait for a spec or
//! platform change). Optimistic concurrency conflicts are Temporary.

use std::time::Duration;

use thiserror::Error;

use crate::arangod::ArangoError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("ArangoDB error: {0}")]
    ArangoError(#[from] ArangoError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unsupported version change: {0}")]
    UnsupportedUpgrade(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

/// Retry class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff, keep the current state
    Temporary,
    /// Requires an external change before retrying
    Permanent,
}

/// Classify a failure for retry purposes
pub fn classify(error: &Error) -> ErrorClass {
    error.classify()
}

fn classify_kube(error: &kube::Error) -> ErrorClass {
    match error {
        kube::Error::Api(resp) => match resp.code {
            408 | 409 | 429 => ErrorClass::Temporary,
            code if code >= 500 => ErrorClass::Temporary,
            _ => ErrorClass::Permanent,
        },
        kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => ErrorClass::Permanent,
        // Transport, TLS and auth refresh failures
        _ => ErrorClass::Temporary,
    }
}

impl Error {
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::KubeError(e) => classify_kube(e),
            Error::ArangoError(e) => {
                if e.is_temporary() {
                    ErrorClass::Temporary
                } else {
                    ErrorClass::Permanent
                }
            }
            Error::TransientError(_) => ErrorClass::Temporary,
            Error::SerializationError(_)
            | Error::MissingObjectKey(_)
            | Error::ValidationError(_)
            | Error::UnsupportedUpgrade(_)
            | Error::NotFound(_)
            | Error::PermanentError(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.classify() == ErrorClass::Temporary
    }

    /// Optimistic concurrency failure: re-read and recompute, never overwrite
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Whether the error reports a Kubernetes object that does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// Short machine readable reason for conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) if self.is_conflict() => "Conflict",
            Error::KubeError(_) => "KubernetesError",
            Error::ArangoError(_) => "DatabaseError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::ValidationError(_) => "InvalidSpec",
            Error::UnsupportedUpgrade(_) => "UnsupportedUpgrade",
            Error::NotFound(_) => "NotFound",
            Error::TransientError(_) => "TransientError",
            Error::PermanentError(_) => "PermanentError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}
