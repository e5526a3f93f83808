//! The error taxonomy for the RQ write-back backend (spec §7).
//!
//! `ShareError` names *kinds*, not wire-level causes: every remote or local
//! I/O failure gets classified into one of these before it crosses a
//! component boundary, so callers can pattern-match on kind rather than on
//! transport-specific status codes.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShareError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Remote reports the path is locked / checked out (HTTP 423 or similar).
    #[error("conflict on {0}")]
    Conflict(String),

    /// 5xx, timeout, connection reset — worth retrying.
    #[error("transient network error on {path}: {detail}")]
    NetworkTransient { path: String, detail: String },

    /// 4xx other than 404/423/409 — retrying will not help.
    #[error("fatal network error on {path}: {detail}")]
    NetworkFatal { path: String, detail: String },

    #[error("cancelled")]
    Cancelled,

    /// A cache sidecar or RQ log entry failed to parse.
    #[error("corrupted state: {0}")]
    Corrupted(String),

    /// Temp file / reserved-prefix path that must never be synced.
    #[error("unsyncable path: {0}")]
    Unsyncable(String),
}

impl ShareError {
    /// True for errors the RQProcessor should retry with backoff (§7: "retry
    /// with backoff up to maxRetries").
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShareError::NetworkTransient { .. })
    }

    /// True when the remote reports the resource missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShareError::NotFound(_))
    }

    /// True when the remote reports the resource as locked/checked out.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ShareError::Conflict(_))
    }

    /// Classifies a `reqwest` failure into a `ShareError` kind for the given
    /// path, following the status-code rules in spec §7/§4.E.
    pub fn from_status(path: &str, status: Option<u16>, detail: String) -> Self {
        match status {
            Some(404) => ShareError::NotFound(path.to_string()),
            Some(409) => ShareError::Conflict(path.to_string()),
            Some(423) => ShareError::Conflict(path.to_string()),
            Some(s) if (500..600).contains(&s) => {
                ShareError::NetworkTransient { path: path.to_string(), detail }
            }
            Some(_) => ShareError::NetworkFatal { path: path.to_string(), detail },
            None => ShareError::NetworkTransient { path: path.to_string(), detail },
        }
    }
}

pub type ShareResult<T> = Result<T, ShareError>;
