//! Errors returned by the ArangoDB client adapter
//!
//! Every error knows whether it is worth retrying, so callers never need to
//! inspect HTTP details themselves.

use thiserror::Error;

/// ArangoDB error number for "hot backup not found"
pub const ERROR_HOT_BACKUP_NOT_FOUND: i64 = 7008;

/// ArangoDB error number for "document not found"
pub const ERROR_ARANGO_DOCUMENT_NOT_FOUND: i64 = 1202;

#[derive(Error, Debug)]
pub enum ArangoError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("ArangoDB responded with {code} (errorNum {error_num}): {message}")]
    Response {
        code: u16,
        error_num: i64,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Transfer job {job_id} failed: {message}")]
    TransferFailed { job_id: String, message: String },
}

impl ArangoError {
    /// Whether a retry could succeed without any change to the spec
    pub fn is_temporary(&self) -> bool {
        match self {
            ArangoError::Connection(_) | ArangoError::Timeout(_) => true,
            // Secrets may be created after the deployment
            ArangoError::MissingCredentials(_) => true,
            ArangoError::Response { code, .. } => {
                matches!(code, 408 | 409 | 429 | 500 | 502 | 503 | 504)
            }
            ArangoError::InvalidResponse(_) => false,
            ArangoError::TransferFailed { .. } => false,
        }
    }

    /// Whether the server reported the requested object missing
    pub fn is_not_found(&self) -> bool {
        match self {
            ArangoError::Response {
                code, error_num, ..
            } => {
                *code == 404
                    || *error_num == ERROR_HOT_BACKUP_NOT_FOUND
                    || *error_num == ERROR_ARANGO_DOCUMENT_NOT_FOUND
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ArangoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ArangoError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ArangoError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            ArangoError::Response {
                code: status.as_u16(),
                error_num: 0,
                message: e.to_string(),
            }
        } else {
            ArangoError::InvalidResponse(e.to_string())
        }
    }
}
